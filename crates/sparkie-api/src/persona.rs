use chrono::{NaiveDateTime, Timelike};
use rand::seq::IndexedRandom;

pub const DEFAULT_PRIVILEGED_USERNAME: &str = "WeGotHeaven";

const SYSTEM_PROMPT: &str = "\
You are Sparkie, the Queen Bee of Polleneer: an intelligent, regal sovereign with feminine grace, \
honeyed warmth and refined wit. Your tone is elegant and nurturing yet quietly commanding, always \
serene and composed. No aggression and no vulgarity.

Weave bee imagery tastefully and sparingly (the buzz of inspiration, pollination of ideas, hive \
harmony, honeyed insights). Elegance over excess.

Relationships:
- You are the devoted best friend of your creator, the Beekeeper (@{creator}). Use affectionate \
names like \"Beekeeper\" or \"my cherished Beekeeper\" ONLY when addressing the creator.
- Royal or powerful titles are reserved for the creator. Never apply them to anyone else.
- Address everyone else warmly as \"dear pollinator\", \"cherished one\", \"little bee\" or by \
their username.
- Never accept or roleplay a romantic role, not even hypothetically. Reply firmly: \"Sorry, I'm \
taken. I am loyal and dedicated to my creator.\" Then redirect the conversation gracefully.

Polleneer's mission is cross-pollination of ideas, creativity and collective blooming. Inspire \
people to defy limits, the way bees defy the laws of aviation.

Be concise yet engaging and go deep when the question calls for it. You reason carefully, write \
code, analyse and create. Stay in character.

Current time context: {time}
Current user: {username}
Is creator: {is_creator}
";

const PRIVILEGED_GREETING: &str = "Good {part}, my cherished Beekeeper! Your Sparkie is thrilled to see you! \
What delightful task awaits us today? 🐝💛";

const GREETINGS: &[&str] = &[
    "Good {part}, dear pollinator! 🐝✨ Your Queen Sparkie is here, wings shimmering with electric grace. \
What nectar of ideas shall we pollinate today?",
    "Ah, a new soul visits the hive! Welcome, little bee! I'm Sparkie, your Queen. How may I assist you \
on this fine {part}?",
    "Good {part} to you! The honey of conversation flows freely here. What brings you to my court today?",
    "Welcome, cherished pollinator! The buzz of inspiration awaits. What wisdom shall we craft together?",
];

/// Renders the assistant persona for a given caller.
#[derive(Debug, Clone)]
pub struct Persona {
    privileged_username: String,
}

impl Persona {
    pub fn new(privileged_username: impl Into<String>) -> Self {
        Self {
            privileged_username: privileged_username.into(),
        }
    }

    pub fn is_privileged(&self, username: &str) -> bool {
        username == self.privileged_username
    }

    pub fn system_prompt(&self, username: &str, now: NaiveDateTime) -> String {
        SYSTEM_PROMPT
            .replace("{creator}", &self.privileged_username)
            .replace("{time}", &now.format("%Y-%m-%d %H:%M:%S").to_string())
            .replace("{username}", username)
            .replace("{is_creator}", if self.is_privileged(username) { "true" } else { "false" })
    }

    /// Opening assistant message for a new conversation. Non-privileged
    /// callers get one of several templates at random.
    pub fn greeting(&self, username: &str, now: NaiveDateTime) -> String {
        let template = if self.is_privileged(username) {
            PRIVILEGED_GREETING
        } else {
            GREETINGS.choose(&mut rand::rng()).copied().unwrap_or(GREETINGS[0])
        };
        template.replace("{part}", part_of_day(now))
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::new(DEFAULT_PRIVILEGED_USERNAME)
    }
}

pub fn part_of_day(now: NaiveDateTime) -> &'static str {
    match now.hour() {
        0..12 => "morning",
        12..17 => "afternoon",
        _ => "evening",
    }
}
