use crate::models::{ConversationRow, MessageRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use sparkie_types::models::Role;

const USER_COLUMNS: &str = "id, username, email, password_hash, is_active, created_at";

impl Database {
    // -- Health --

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    // -- Users --

    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (username, email, password_hash) VALUES (?1, ?2, ?3)",
                (username, email, password_hash),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn set_user_active(&self, id: i64, active: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET is_active = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                rusqlite::params![id, active],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Conversations --

    pub fn create_conversation(&self, user_id: i64, title: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO conversations (user_id, title) VALUES (?1, ?2)",
                rusqlite::params![user_id, title],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT c.id, c.user_id, c.title, c.created_at, c.updated_at,
                            (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                     FROM conversations c
                     WHERE c.id = ?1",
                    [id],
                    map_conversation,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// A user's conversations, most recently active first.
    pub fn list_conversations(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            // Aggregate in one query instead of one COUNT per conversation
            let mut stmt = conn.prepare(
                "SELECT c.id, c.user_id, c.title, c.created_at, c.updated_at, COUNT(m.id)
                 FROM conversations c
                 LEFT JOIN messages m ON m.conversation_id = c.id
                 WHERE c.user_id = ?1
                 GROUP BY c.id
                 ORDER BY c.updated_at DESC, c.id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Deletes a conversation owned by `user_id`. Its messages go with it.
    pub fn delete_conversation(&self, id: i64, user_id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let deleted = conn.execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id, user_id],
            )?;
            Ok(deleted > 0)
        })
    }

    // -- Messages --

    /// Appends a message and bumps the conversation's `updated_at` in one
    /// transaction.
    pub fn insert_message(&self, conversation_id: i64, role: Role, content: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (conversation_id, role, content) VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation_id, role.as_str(), content],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE conversations
                 SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                [conversation_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Full history of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([conversation_id], |row| {
                    let role: String = row.get(2)?;
                    let role = role.parse::<Role>().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                    })?;
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        role,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, column: &str, value: P) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password_hash: row.get(3)?,
                is_active: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        message_count: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_user() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let uid = db.create_user("pollinator", "p@hive.io", "hash").unwrap();
        (db, uid)
    }

    #[test]
    fn user_lookup_by_every_key() {
        let (db, uid) = db_with_user();

        let by_name = db.get_user_by_username("pollinator").unwrap().unwrap();
        assert_eq!(by_name.id, uid);
        assert!(by_name.is_active);
        assert_eq!(db.get_user_by_email("p@hive.io").unwrap().unwrap().id, uid);
        assert_eq!(db.get_user_by_id(uid).unwrap().unwrap().username, "pollinator");
        assert!(db.get_user_by_username("drone").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let (db, _) = db_with_user();
        let err = db.create_user("pollinator", "other@hive.io", "hash").unwrap_err();
        assert!(crate::is_constraint_violation(&err));

        let err = db.create_user("drone", "p@hive.io", "hash").unwrap_err();
        assert!(crate::is_constraint_violation(&err));
    }

    #[test]
    fn other_failures_are_not_constraint_violations() {
        let (db, _) = db_with_user();
        let err = db.with_conn(|conn| Ok(conn.execute("SELECT * FROM no_such_table", [])?)).unwrap_err();
        assert!(!crate::is_constraint_violation(&err));
        assert!(!crate::is_constraint_violation(&anyhow::anyhow!("lock poisoned")));
    }

    #[test]
    fn disabling_a_user() {
        let (db, uid) = db_with_user();
        assert!(db.set_user_active(uid, false).unwrap());
        assert!(!db.get_user_by_id(uid).unwrap().unwrap().is_active);
    }

    #[test]
    fn messages_come_back_in_insertion_order() {
        let (db, uid) = db_with_user();
        let cid = db.create_conversation(uid, "Chat").unwrap();

        db.insert_message(cid, Role::Assistant, "greeting").unwrap();
        db.insert_message(cid, Role::User, "question").unwrap();
        db.insert_message(cid, Role::Assistant, "answer").unwrap();

        let rows = db.get_messages(cid).unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["greeting", "question", "answer"]);
        assert_eq!(rows[1].role, Role::User);
    }

    #[test]
    fn list_includes_message_counts() {
        let (db, uid) = db_with_user();
        let empty = db.create_conversation(uid, "Empty").unwrap();
        let busy = db.create_conversation(uid, "Busy").unwrap();
        db.insert_message(busy, Role::User, "one").unwrap();
        db.insert_message(busy, Role::Assistant, "two").unwrap();

        let list = db.list_conversations(uid, 50, 0).unwrap();
        assert_eq!(list.len(), 2);
        // Busy was touched last, so it sorts first
        assert_eq!(list[0].id, busy);
        assert_eq!(list[0].message_count, 2);
        assert_eq!(list[1].id, empty);
        assert_eq!(list[1].message_count, 0);

        assert_eq!(db.list_conversations(uid, 1, 1).unwrap()[0].id, empty);
    }

    #[test]
    fn delete_cascades_to_messages() {
        let (db, uid) = db_with_user();
        let cid = db.create_conversation(uid, "Chat").unwrap();
        db.insert_message(cid, Role::User, "hello").unwrap();

        let other = db.create_user("drone", "d@hive.io", "hash").unwrap();
        assert!(!db.delete_conversation(cid, other).unwrap());

        assert!(db.delete_conversation(cid, uid).unwrap());
        assert!(db.get_conversation(cid).unwrap().is_none());
        assert!(db.get_messages(cid).unwrap().is_empty());
    }
}
