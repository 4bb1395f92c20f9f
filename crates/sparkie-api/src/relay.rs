use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Local;
use futures_util::{Stream, StreamExt};
use sparkie_db::Database;
use sparkie_db::models::MessageRow;
use sparkie_llm::{ChatClient, ChatOptions, UpstreamError};
use sparkie_types::api::{ChatRequest, StreamFrame};
use sparkie_types::models::{ChatMessage, Role};
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};

use crate::persona::Persona;
use crate::store;

/// Most recent stored messages sent upstream with each turn.
pub const HISTORY_LIMIT: usize = 20;
pub const DEFAULT_TITLE: &str = "Chat with Sparkie";

const FRAME_BUFFER: usize = 64;

pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("conversation store failed: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// The authenticated user a turn is run for.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub conversation_id: Option<i64>,
    pub message: String,
    pub options: ChatOptions,
}

impl From<ChatRequest> for Turn {
    fn from(req: ChatRequest) -> Self {
        Self {
            conversation_id: req.conversation_id,
            message: req.message,
            options: ChatOptions {
                temperature: req.temperature,
                max_tokens: req.max_tokens,
            },
        }
    }
}

/// One async mutex per conversation so turns on the same conversation run
/// one at a time. Entries die with their last holder.
#[derive(Default)]
struct TurnLocks {
    locks: Mutex<HashMap<i64, Weak<tokio::sync::Mutex<()>>>>,
}

impl TurnLocks {
    async fn acquire(&self, conversation_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);

            match locks.get(&conversation_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(conversation_id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

struct PreparedTurn {
    conversation_id: i64,
    prompt: Vec<ChatMessage>,
    _guard: OwnedMutexGuard<()>,
}

/// Runs one chat turn: resolve or create the conversation, persist the
/// user's message, call the model with bounded history, persist the reply.
pub struct ChatRelay {
    db: Arc<Database>,
    client: Arc<dyn ChatClient>,
    persona: Persona,
    locks: TurnLocks,
}

impl ChatRelay {
    pub fn new(db: Arc<Database>, client: Arc<dyn ChatClient>, persona: Persona) -> Self {
        Self {
            db,
            client,
            persona,
            locks: TurnLocks::default(),
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Buffered turn. Returns the conversation id and the full reply.
    pub async fn complete(&self, caller: &Caller, turn: Turn) -> Result<(i64, String), RelayError> {
        let prepared = self.prepare(caller, &turn).await?;
        let conversation_id = prepared.conversation_id;

        let reply = self.client.complete(&prepared.prompt, turn.options).await?;

        let content = reply.clone();
        store::blocking(&self.db, move |db| {
            db.insert_message(conversation_id, Role::Assistant, &content)
        })
        .await?;

        info!(conversation_id, chars = reply.len(), "Chat turn completed");
        Ok((conversation_id, reply))
    }

    /// Streaming turn. Failures before the first frame come back as errors;
    /// after that they arrive as a final frame with `error` set.
    ///
    /// The upstream stream is drained by a background task, so a client that
    /// goes away mid-reply still gets the full reply saved.
    pub async fn stream(&self, caller: &Caller, turn: Turn) -> Result<FrameStream, RelayError> {
        let prepared = self.prepare(caller, &turn).await?;
        let mut upstream = self.client.stream(&prepared.prompt, turn.options).await?;

        let db = Arc::clone(&self.db);
        let (tx, mut rx) = mpsc::channel::<StreamFrame>(FRAME_BUFFER);

        tokio::spawn(async move {
            let PreparedTurn { conversation_id, _guard, .. } = prepared;
            let mut reply = String::new();
            let mut listening = true;

            while let Some(fragment) = upstream.next().await {
                match fragment {
                    Ok(text) => {
                        reply.push_str(&text);
                        if listening && tx.send(StreamFrame::chunk(text)).await.is_err() {
                            debug!(conversation_id, "Stream client went away, finishing reply in background");
                            listening = false;
                        }
                    }
                    Err(e) => {
                        error!(conversation_id, "Upstream stream failed: {}", e);
                        let _ = tx.send(StreamFrame::failed("Upstream service failure")).await;
                        return;
                    }
                }
            }

            let chars = reply.len();
            let saved = store::blocking(&db, move |db| {
                db.insert_message(conversation_id, Role::Assistant, &reply)
            })
            .await;

            let last = match saved {
                Ok(_) => {
                    info!(conversation_id, chars, "Streamed chat turn completed");
                    StreamFrame::done(conversation_id)
                }
                Err(e) => {
                    error!(conversation_id, "Failed to save streamed reply: {:#}", e);
                    StreamFrame::failed("Failed to save reply")
                }
            };
            let _ = tx.send(last).await;
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        }))
    }

    /// Steps shared by both modes. The returned turn holds the conversation's
    /// lock until it is dropped.
    async fn prepare(&self, caller: &Caller, turn: &Turn) -> Result<PreparedTurn, RelayError> {
        let now = Local::now().naive_local();

        let (conversation_id, guard) = match turn.conversation_id {
            Some(id) => {
                let guard = self.locks.acquire(id).await;
                let owner = store::blocking(&self.db, move |db| {
                    Ok(db.get_conversation(id)?.map(|c| c.user_id))
                })
                .await?;

                if owner != Some(caller.user_id) {
                    warn!(conversation_id = id, user_id = caller.user_id, "Conversation not found for caller");
                    return Err(RelayError::ConversationNotFound(id));
                }
                (id, guard)
            }
            None => {
                let greeting = self.persona.greeting(&caller.username, now);
                let user_id = caller.user_id;
                let id = store::blocking(&self.db, move |db| {
                    let id = db.create_conversation(user_id, DEFAULT_TITLE)?;
                    db.insert_message(id, Role::Assistant, &greeting)?;
                    Ok(id)
                })
                .await?;

                info!(conversation_id = id, user_id, "Started new conversation");
                (id, self.locks.acquire(id).await)
            }
        };

        let message = turn.message.clone();
        let history = store::blocking(&self.db, move |db| {
            db.insert_message(conversation_id, Role::User, &message)?;
            db.get_messages(conversation_id)
        })
        .await?;

        let system = self.persona.system_prompt(&caller.username, now);
        Ok(PreparedTurn {
            conversation_id,
            prompt: build_prompt(system, history),
            _guard: guard,
        })
    }
}

/// System message first, then the newest `HISTORY_LIMIT` stored messages in
/// chronological order.
pub fn build_prompt(system: String, history: Vec<MessageRow>) -> Vec<ChatMessage> {
    let skip = history.len().saturating_sub(HISTORY_LIMIT);

    std::iter::once(ChatMessage::system(system))
        .chain(
            history
                .into_iter()
                .skip(skip)
                .map(|row| ChatMessage::new(row.role, row.content)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream;
    use sparkie_llm::TextStream;

    use super::*;

    /// Scripted model: replies with `fragments` and records every prompt.
    #[derive(Default)]
    struct FakeClient {
        fragments: Vec<String>,
        fail_after: Option<usize>,
        delay: Option<Duration>,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeClient {
        fn replying(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            }
        }

        fn record(&self, messages: &[ChatMessage]) {
            self.prompts.lock().unwrap().push(messages.to_vec());
        }

        fn prompts(&self) -> Vec<Vec<ChatMessage>> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        async fn complete(&self, messages: &[ChatMessage], _: ChatOptions) -> Result<String, UpstreamError> {
            self.record(messages);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_after.is_some() {
                return Err(UpstreamError::Status { status: 503, body: "overloaded".into() });
            }
            Ok(self.fragments.concat())
        }

        async fn stream(&self, messages: &[ChatMessage], _: ChatOptions) -> Result<TextStream, UpstreamError> {
            self.record(messages);
            let mut items: Vec<Result<String, UpstreamError>> =
                self.fragments.iter().cloned().map(Ok).collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(UpstreamError::Decode("connection reset".into())));
            }
            let delay = self.delay;
            Ok(Box::pin(stream::iter(items).then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })))
        }
    }

    struct Fixture {
        db: Arc<Database>,
        client: Arc<FakeClient>,
        relay: ChatRelay,
        caller: Caller,
    }

    fn fixture(client: FakeClient) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user_id = db.create_user("pollinator", "p@hive.io", "hash").unwrap();
        let client = Arc::new(client);
        let relay = ChatRelay::new(db.clone(), client.clone(), Persona::default());
        Fixture {
            db,
            client,
            relay,
            caller: Caller {
                user_id,
                username: "pollinator".into(),
            },
        }
    }

    fn turn(conversation_id: Option<i64>, message: &str) -> Turn {
        Turn {
            conversation_id,
            message: message.into(),
            options: ChatOptions::default(),
        }
    }

    fn roles(db: &Database, conversation_id: i64) -> Vec<Role> {
        db.get_messages(conversation_id).unwrap().iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn new_conversation_starts_with_a_greeting() {
        let fx = fixture(FakeClient::replying(&["Welcome to the hive!"]));

        let (cid, reply) = fx.relay.complete(&fx.caller, turn(None, "Hello")).await.unwrap();
        assert_eq!(reply, "Welcome to the hive!");

        let messages = fx.db.get_messages(cid).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[2].content, "Welcome to the hive!");

        let conversation = fx.db.get_conversation(cid).unwrap().unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);

        let prompt = &fx.client.prompts()[0];
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[0].content.contains("Current user: pollinator"));
        assert_eq!(prompt[1].role, Role::Assistant);
        assert_eq!(prompt[2], ChatMessage::new(Role::User, "Hello"));
    }

    #[tokio::test]
    async fn prompt_history_is_capped() {
        let fx = fixture(FakeClient::replying(&["ok"]));
        let cid = fx.db.create_conversation(fx.caller.user_id, "Long").unwrap();
        for i in 0..30 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            fx.db.insert_message(cid, role, &format!("m{i}")).unwrap();
        }

        fx.relay.complete(&fx.caller, turn(Some(cid), "latest")).await.unwrap();

        let prompt = &fx.client.prompts()[0];
        assert_eq!(prompt.len(), HISTORY_LIMIT + 1);
        assert_eq!(prompt[0].role, Role::System);
        // 31 stored before the call, so the oldest 11 fall off
        assert_eq!(prompt[1].content, "m11");
        assert_eq!(prompt[HISTORY_LIMIT].content, "latest");
    }

    #[tokio::test]
    async fn streamed_reply_is_forwarded_and_saved_whole() {
        let fx = fixture(FakeClient::replying(&["Hi", " there", "!"]));
        let cid = fx.db.create_conversation(fx.caller.user_id, "Chat").unwrap();

        let frames: Vec<_> = fx
            .relay
            .stream(&fx.caller, turn(Some(cid), "Hello"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                StreamFrame::chunk("Hi"),
                StreamFrame::chunk(" there"),
                StreamFrame::chunk("!"),
                StreamFrame::done(cid),
            ]
        );

        let messages = fx.db.get_messages(cid).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there!");
    }

    #[tokio::test]
    async fn stream_failure_ends_with_error_frame_and_saves_nothing() {
        let client = FakeClient {
            fail_after: Some(1),
            ..FakeClient::replying(&["Hi", " there"])
        };
        let fx = fixture(client);
        let cid = fx.db.create_conversation(fx.caller.user_id, "Chat").unwrap();

        let frames: Vec<_> = fx
            .relay
            .stream(&fx.caller, turn(Some(cid), "Hello"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], StreamFrame::chunk("Hi"));
        assert!(frames[1].done);
        assert!(frames[1].error.is_some());
        assert_eq!(roles(&fx.db, cid), [Role::User]);
    }

    #[tokio::test]
    async fn reply_that_cannot_be_saved_is_not_confirmed() {
        let client = FakeClient {
            delay: Some(Duration::from_millis(50)),
            ..FakeClient::replying(&["Hi", " there"])
        };
        let fx = fixture(client);
        let cid = fx.db.create_conversation(fx.caller.user_id, "Chat").unwrap();

        let frames = fx.relay.stream(&fx.caller, turn(Some(cid), "Hello")).await.unwrap();
        // Gone before the reply finishes, so the assistant insert hits the foreign key.
        assert!(fx.db.delete_conversation(cid, fx.caller.user_id).unwrap());
        let frames: Vec<_> = frames.collect().await;

        let (last, chunks) = frames.split_last().unwrap();
        assert_eq!(chunks, [StreamFrame::chunk("Hi"), StreamFrame::chunk(" there")]);
        assert!(last.done);
        assert_eq!(last.error.as_deref(), Some("Failed to save reply"));
        assert!(last.conversation_id.is_none());
        assert!(fx.db.get_messages(cid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_keeps_the_user_message() {
        let client = FakeClient {
            fail_after: Some(0),
            ..Default::default()
        };
        let fx = fixture(client);

        let err = fx.relay.complete(&fx.caller, turn(None, "Hello")).await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream(UpstreamError::Status { status: 503, .. })));

        let conversations = fx.db.list_conversations(fx.caller.user_id, 10, 0).unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(roles(&fx.db, conversations[0].id), [Role::Assistant, Role::User]);
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_found() {
        let fx = fixture(FakeClient::replying(&["ok"]));
        let other = fx.db.create_user("drone", "d@hive.io", "hash").unwrap();
        let theirs = fx.db.create_conversation(other, "Private").unwrap();

        let err = fx.relay.complete(&fx.caller, turn(Some(theirs), "peek")).await.unwrap_err();
        assert!(matches!(err, RelayError::ConversationNotFound(id) if id == theirs));

        let err = fx.relay.stream(&fx.caller, turn(Some(9999), "peek")).await.err().unwrap();
        assert!(matches!(err, RelayError::ConversationNotFound(9999)));

        assert!(fx.db.get_messages(theirs).unwrap().is_empty());
        assert!(fx.client.prompts().is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_conversation_take_turns() {
        let client = FakeClient {
            delay: Some(Duration::from_millis(50)),
            ..FakeClient::replying(&["reply"])
        };
        let fx = fixture(client);
        let cid = fx.db.create_conversation(fx.caller.user_id, "Chat").unwrap();

        let (a, b) = tokio::join!(
            fx.relay.complete(&fx.caller, turn(Some(cid), "first")),
            fx.relay.complete(&fx.caller, turn(Some(cid), "second")),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(
            roles(&fx.db, cid),
            [Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        // The second turn saw the first one's reply
        assert_eq!(fx.client.prompts()[1].len(), 4);
    }

    #[tokio::test]
    async fn privileged_caller_is_greeted_as_creator() {
        let fx = fixture(FakeClient::replying(&["ok"]));
        let uid = fx.db.create_user("WeGotHeaven", "b@hive.io", "hash").unwrap();
        let creator = Caller {
            user_id: uid,
            username: "WeGotHeaven".into(),
        };

        let (cid, _) = fx.relay.complete(&creator, turn(None, "hi")).await.unwrap();
        let greeting = &fx.db.get_messages(cid).unwrap()[0].content;
        assert!(greeting.contains("my cherished Beekeeper"));
        assert!(fx.client.prompts()[0][0].content.contains("Is creator: true"));
    }
}
