// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use crew_model::{Attachment, Message, Role, ToolCall};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::session::{Session, SessionMessage};

/// Embedded relational store for sessions, keyed by session id.
///
/// Messages are stored append-only under a `(session_id, seq)` composite
/// key; loading replays them in `seq` order, which reproduces the exact
/// in-memory log.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

/// Listing row: enough to render a session picker without loading logs.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub starred: bool,
    pub message_count: u64,
}

impl SessionStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening session store {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store; used by tests and ephemeral runs.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id                TEXT PRIMARY KEY,
                title             TEXT NOT NULL DEFAULT '',
                created_at        TEXT NOT NULL,
                input_tokens      INTEGER NOT NULL DEFAULT 0,
                output_tokens     INTEGER NOT NULL DEFAULT 0,
                reasoning_tokens  INTEGER NOT NULL DEFAULT 0,
                cost              REAL NOT NULL DEFAULT 0,
                starred           INTEGER NOT NULL DEFAULT 0,
                working_dir       TEXT NOT NULL DEFAULT '',
                tools_approved    INTEGER NOT NULL DEFAULT 0,
                thinking          INTEGER NOT NULL DEFAULT 0,
                hide_tool_results INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                session_id        TEXT NOT NULL,
                seq               INTEGER NOT NULL,
                agent_name        TEXT NOT NULL,
                role              TEXT NOT NULL,
                content           TEXT NOT NULL,
                reasoning_content TEXT,
                tool_call_id      TEXT,
                tool_calls_json   TEXT,
                attachments_json  TEXT,
                implicit          INTEGER NOT NULL DEFAULT 0,
                timestamp         TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_seq
                ON messages(session_id, seq);
            "#,
        )
        .context("creating session store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist the session row and append any messages not yet stored.
    ///
    /// Stored messages are immutable; only rows beyond the current maximum
    /// `seq` are inserted, so repeated saves of a growing session are cheap
    /// and never rewrite history.
    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("session store lock poisoned");
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO sessions (
                id, title, created_at, input_tokens, output_tokens,
                reasoning_tokens, cost, starred, working_dir,
                tools_approved, thinking, hide_tool_results
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                reasoning_tokens = excluded.reasoning_tokens,
                cost = excluded.cost,
                starred = excluded.starred,
                working_dir = excluded.working_dir,
                tools_approved = excluded.tools_approved,
                thinking = excluded.thinking,
                hide_tool_results = excluded.hide_tool_results
            "#,
            params![
                session.id,
                session.title,
                session.created_at.to_rfc3339(),
                session.input_tokens as i64,
                session.output_tokens as i64,
                session.reasoning_tokens as i64,
                session.cost,
                session.starred as i64,
                session.working_dir.to_string_lossy().into_owned(),
                session.tools_approved as i64,
                session.thinking as i64,
                session.hide_tool_results as i64,
            ],
        )?;

        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM messages WHERE session_id = ?1",
                params![session.id],
                |row| row.get(0),
            )
            .context("reading message high-water mark")?;

        for (seq, msg) in session
            .messages()
            .iter()
            .enumerate()
            .skip(next_seq as usize)
        {
            let tool_calls_json = if msg.message.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&msg.message.tool_calls)?)
            };
            let attachments_json = if msg.message.attachments.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&msg.message.attachments)?)
            };
            tx.execute(
                r#"
                INSERT INTO messages (
                    session_id, seq, agent_name, role, content,
                    reasoning_content, tool_call_id, tool_calls_json,
                    attachments_json, implicit, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    session.id,
                    seq as i64,
                    msg.agent_name,
                    msg.message.role.as_str(),
                    msg.message.content,
                    msg.message.reasoning_content,
                    msg.message.tool_call_id,
                    tool_calls_json,
                    attachments_json,
                    msg.implicit as i64,
                    msg.timestamp.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        debug!(session_id = %session.id, messages = session.len(), "session saved");
        Ok(())
    }

    /// Load a session, replaying its messages in `seq` order.
    pub fn load(&self, id: &str) -> anyhow::Result<Session> {
        let conn = self.conn.lock().expect("session store lock poisoned");

        let row = conn
            .query_row(
                r#"
                SELECT title, created_at, input_tokens, output_tokens,
                       reasoning_tokens, cost, starred, working_dir,
                       tools_approved, thinking, hide_tool_results
                FROM sessions WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("unknown session: {id}"))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT agent_name, role, content, reasoning_content, tool_call_id,
                   tool_calls_json, attachments_json, implicit, timestamp
            FROM messages WHERE session_id = ?1 ORDER BY seq
            "#,
        )?;
        let messages = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut log = Vec::with_capacity(messages.len());
        for (agent, role, content, reasoning, tcid, calls, attachments, implicit, ts) in messages
        {
            let tool_calls: Vec<ToolCall> = match calls {
                Some(json) => serde_json::from_str(&json).context("decoding tool_calls_json")?,
                None => Vec::new(),
            };
            let attachments: Vec<Attachment> = match attachments {
                Some(json) => {
                    serde_json::from_str(&json).context("decoding attachments_json")?
                }
                None => Vec::new(),
            };
            log.push(SessionMessage {
                agent_name: agent,
                message: Message {
                    role: role.parse()?,
                    content,
                    reasoning_content: reasoning,
                    tool_calls,
                    tool_call_id: tcid,
                    attachments,
                },
                implicit: implicit != 0,
                timestamp: parse_timestamp(&ts)?,
            });
        }

        let (
            title,
            created_at,
            input_tokens,
            output_tokens,
            reasoning_tokens,
            cost,
            starred,
            working_dir,
            tools_approved,
            thinking,
            hide_tool_results,
        ) = row;

        let mut session =
            Session::from_parts(id.to_string(), title, parse_timestamp(&created_at)?, log);
        session.input_tokens = input_tokens as u64;
        session.output_tokens = output_tokens as u64;
        session.reasoning_tokens = reasoning_tokens as u64;
        session.cost = cost;
        session.starred = starred != 0;
        session.working_dir = PathBuf::from(working_dir);
        session.tools_approved = tools_approved != 0;
        session.thinking = thinking != 0;
        session.hide_tool_results = hide_tool_results != 0;
        Ok(session)
    }

    pub fn list(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().expect("session store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.title, s.created_at, s.starred,
                   (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
            FROM sessions s ORDER BY s.created_at DESC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, title, created_at, starred, count)| {
                Ok(SessionSummary {
                    id,
                    title,
                    created_at: parse_timestamp(&created_at)?,
                    starred: starred != 0,
                    message_count: count as u64,
                })
            })
            .collect()
    }

    pub fn set_starred(&self, id: &str, starred: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("session store lock poisoned");
        let updated = conn.execute(
            "UPDATE sessions SET starred = ?2 WHERE id = ?1",
            params![id, starred as i64],
        )?;
        if updated == 0 {
            anyhow::bail!("unknown session: {id}");
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("session store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp {s:?}"))?
        .with_timezone(&Utc))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crew_model::{Message, Role, ToolCall};

    use super::*;
    use crate::session::{Session, SessionMessage};

    fn sample_session() -> Session {
        let mut s = Session::new();
        s.title = "demo".into();
        s.push_user("root", "hello");
        s.push(SessionMessage::new(
            "root",
            Message::assistant_with_calls(
                "let me check",
                Some("thinking".into()),
                vec![ToolCall::new("c1", "echo", r#"{"text":"hi"}"#)],
            ),
        ));
        s.push(SessionMessage::implicit(
            "root",
            Message::tool_result("c1", "hi"),
        ));
        s.add_usage(100, 50, 10, 0.005);
        s
    }

    #[test]
    fn save_and_load_round_trips_messages() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = sample_session();
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.title, "demo");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.messages()[0].message.content, "hello");
        assert_eq!(loaded.messages()[1].message.tool_calls.len(), 1);
        assert_eq!(
            loaded.messages()[1].message.tool_calls[0].function.name,
            "echo"
        );
        assert_eq!(
            loaded.messages()[1].message.reasoning_content.as_deref(),
            Some("thinking")
        );
        assert!(loaded.messages()[2].implicit);
        assert_eq!(
            loaded.messages()[2].message.tool_call_id.as_deref(),
            Some("c1")
        );
    }

    #[test]
    fn counters_survive_the_round_trip() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = sample_session();
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.input_tokens, 100);
        assert_eq!(loaded.output_tokens, 50);
        assert_eq!(loaded.reasoning_tokens, 10);
        assert!((loaded.cost - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_saves_only_append_new_messages() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut session = sample_session();
        store.save(&session).unwrap();
        store.save(&session).unwrap();
        assert_eq!(store.load(&session.id).unwrap().len(), 3);

        session.push(SessionMessage::new("root", Message::assistant("done")));
        store.save(&session).unwrap();
        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.messages()[3].message.content, "done");
    }

    #[test]
    fn load_replays_in_seq_order() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut session = Session::new();
        for i in 0..10 {
            session.push_user("root", format!("msg {i}"));
        }
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        for (i, m) in loaded.messages().iter().enumerate() {
            assert_eq!(m.message.content, format!("msg {i}"));
        }
    }

    #[test]
    fn load_unknown_session_errors() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.load("missing").is_err());
    }

    #[test]
    fn behavior_flags_round_trip() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut session = Session::new();
        session.tools_approved = true;
        session.thinking = true;
        session.working_dir = PathBuf::from("/tmp/project");
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert!(loaded.tools_approved);
        assert!(loaded.thinking);
        assert!(!loaded.hide_tool_results);
        assert_eq!(loaded.working_dir, PathBuf::from("/tmp/project"));
    }

    #[test]
    fn list_returns_summaries_with_counts() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = sample_session();
        store.save(&session).unwrap();
        store.save(&Session::new()).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        let entry = list.iter().find(|s| s.id == session.id).unwrap();
        assert_eq!(entry.title, "demo");
        assert_eq!(entry.message_count, 3);
    }

    #[test]
    fn star_and_delete() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = sample_session();
        store.save(&session).unwrap();

        store.set_starred(&session.id, true).unwrap();
        assert!(store.load(&session.id).unwrap().starred);

        store.delete(&session.id).unwrap();
        assert!(store.load(&session.id).is_err());
        assert!(store.set_starred(&session.id, true).is_err());
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let session = sample_session();
        {
            let store = SessionStore::open(&path).unwrap();
            store.save(&session).unwrap();
        }
        let store = SessionStore::open(&path).unwrap();
        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[test]
    fn roles_round_trip_as_text() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut session = Session::new();
        session.push(SessionMessage::new("root", Message::system("sys")));
        session.push_user("root", "u");
        session.push(SessionMessage::new("root", Message::assistant("a")));
        session.push(SessionMessage::new("root", Message::tool_result("c", "t")));
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        let roles: Vec<Role> = loaded.messages().iter().map(|m| m.message.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    }
}
