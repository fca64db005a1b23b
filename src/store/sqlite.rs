//! 基于 rusqlite 的后备存储
//!
//! 单连接放在 `Mutex` 里；同步引擎在阻塞线程池中调用，事务期间独占连接。
//! 事务以 `BEGIN IMMEDIATE` 开启，未提交就被丢弃时自动 `ROLLBACK`。

use super::schema::CREATE_TABLES;
use super::{
    BackingStore, MemoryRow, MessageRow, NewSessionRow, PersonaRow, SettingsRow, StoreSnapshot,
    StoreTransaction, TokenRow,
};
use crate::cache::types::{ChatMessage, Persona, PersonaKey, Session, TokenUsage};
use crate::cache::PendingMemory;
use crate::error::{CacheError, Result, StoreError};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!(path = %path.display(), "🗄️ SQLite 数据库已打开");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库，进程退出即丢失
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CacheError::from(StoreError::Lock(e.to_string())))
    }
}

impl BackingStore for SqliteStore {
    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<StoreSnapshot> {
        let conn = self.lock()?;

        let settings = conn
            .prepare(
                "SELECT user_id, api_key, base_url, model, temperature, token_limit,
                        current_persona, enabled_tools, tts_voice, tts_style, tts_endpoint,
                        api_presets, title_model
                 FROM user_settings",
            )?
            .query_map([], |row| {
                Ok(SettingsRow {
                    user_id: row.get(0)?,
                    api_key: row.get(1)?,
                    base_url: row.get(2)?,
                    model: row.get(3)?,
                    temperature: row.get(4)?,
                    token_limit: row.get(5)?,
                    current_persona: row.get(6)?,
                    enabled_tools: row.get(7)?,
                    tts_voice: row.get(8)?,
                    tts_style: row.get(9)?,
                    tts_endpoint: row.get(10)?,
                    api_presets: row.get(11)?,
                    title_model: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let personas = conn
            .prepare(
                "SELECT user_id, name, system_prompt, current_session_id
                 FROM user_personas ORDER BY id",
            )?
            .query_map([], |row| {
                Ok(PersonaRow {
                    user_id: row.get(0)?,
                    persona: Persona {
                        name: row.get(1)?,
                        system_prompt: row.get(2)?,
                        current_session_id: row.get(3)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let sessions = conn
            .prepare(
                "SELECT id, user_id, persona_name, title, created_at
                 FROM user_sessions ORDER BY id",
            )?
            .query_map([], |row| {
                let created_at: Option<String> = row.get(4)?;
                Ok(Session {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    persona_name: row.get(2)?,
                    title: row.get(3)?,
                    created_at: parse_timestamp(created_at.as_deref()),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let messages = conn
            .prepare(
                "SELECT session_id, role, content FROM user_conversations
                 WHERE session_id IS NOT NULL ORDER BY id",
            )?
            .query_map([], |row| {
                Ok(MessageRow {
                    session_id: row.get(0)?,
                    message: ChatMessage {
                        role: row.get(1)?,
                        content: row.get(2)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let tokens = conn
            .prepare(
                "SELECT user_id, persona_name, prompt_tokens, completion_tokens, total_tokens
                 FROM user_persona_tokens",
            )?
            .query_map([], |row| {
                Ok(TokenRow {
                    key: PersonaKey::new(row.get::<_, i64>(0)?, row.get::<_, String>(1)?),
                    usage: TokenUsage {
                        prompt_tokens: to_u64(row.get(2)?),
                        completion_tokens: to_u64(row.get(3)?),
                        total_tokens: to_u64(row.get(4)?),
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let memories = conn
            .prepare(
                "SELECT id, user_id, content, source, embedding
                 FROM user_memories ORDER BY id",
            )?
            .query_map([], |row| {
                Ok(MemoryRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    content: row.get(2)?,
                    source: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    embedding: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let max_row_id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM user_sessions", [], |row| row.get(0))?;
        // AUTOINCREMENT 的序列号可能大于现存最大 ID（行被删除过）
        let sequence: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'user_sessions'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(StoreSnapshot {
            settings,
            personas,
            sessions,
            messages,
            tokens,
            memories,
            max_session_id: max_row_id.unwrap_or(0).max(sequence.unwrap_or(0)),
        })
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

fn to_u64(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

/// 缓存侧计数已在 `TokenUsage::MAX` 饱和，这里的截断只对绕过缓存直接写入的值生效
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or_else(|_| {
        debug!(value, "token 计数超出 INTEGER 范围，已截断为 i64::MAX");
        i64::MAX
    })
}

/// 兼容 RFC 3339 与 SQLite 默认的 `YYYY-MM-DD HH:MM:SS`；无法解析时取当前时间
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        Ok(naive) => naive.and_utc(),
        Err(e) => {
            warn!(value = raw, error = %e, "created_at 无法解析，使用当前时间");
            Utc::now()
        }
    }
}

// ── 事务 ─────────────────────────────────────────────────────────────────────

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn upsert_settings(&mut self, row: &SettingsRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_settings (
                 user_id, api_key, base_url, model, temperature, token_limit,
                 current_persona, enabled_tools, tts_voice, tts_style, tts_endpoint,
                 api_presets, title_model
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (user_id) DO UPDATE SET
                 api_key = excluded.api_key,
                 base_url = excluded.base_url,
                 model = excluded.model,
                 temperature = excluded.temperature,
                 token_limit = excluded.token_limit,
                 current_persona = excluded.current_persona,
                 enabled_tools = excluded.enabled_tools,
                 tts_voice = excluded.tts_voice,
                 tts_style = excluded.tts_style,
                 tts_endpoint = excluded.tts_endpoint,
                 api_presets = excluded.api_presets,
                 title_model = excluded.title_model",
            params![
                row.user_id,
                row.api_key,
                row.base_url,
                row.model,
                row.temperature,
                row.token_limit,
                row.current_persona,
                row.enabled_tools,
                row.tts_voice,
                row.tts_style,
                row.tts_endpoint,
                row.api_presets,
                row.title_model,
            ],
        )?;
        Ok(())
    }

    fn delete_persona_cascade(&mut self, key: &PersonaKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM user_conversations WHERE session_id IN (
                 SELECT id FROM user_sessions WHERE user_id = ?1 AND persona_name = ?2
             )",
            params![key.user_id, key.persona],
        )?;
        self.conn.execute(
            "DELETE FROM user_sessions WHERE user_id = ?1 AND persona_name = ?2",
            params![key.user_id, key.persona],
        )?;
        self.conn.execute(
            "DELETE FROM user_personas WHERE user_id = ?1 AND name = ?2",
            params![key.user_id, key.persona],
        )?;
        self.conn.execute(
            "DELETE FROM user_persona_tokens WHERE user_id = ?1 AND persona_name = ?2",
            params![key.user_id, key.persona],
        )?;
        Ok(())
    }

    fn upsert_persona(&mut self, user_id: i64, persona: &Persona) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_personas (user_id, name, system_prompt, current_session_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, name) DO UPDATE SET
                 system_prompt = excluded.system_prompt,
                 current_session_id = excluded.current_session_id",
            params![
                user_id,
                persona.name,
                persona.system_prompt,
                persona.current_session_id
            ],
        )?;
        Ok(())
    }

    fn insert_session(&mut self, row: &NewSessionRow) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO user_sessions (user_id, persona_name, title, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.user_id,
                row.persona_name,
                row.title,
                row.created_at.to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_session_title(&mut self, session_id: i64, title: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE user_sessions SET title = ?1 WHERE id = ?2",
            params![title, session_id],
        )?;
        Ok(())
    }

    fn delete_session(&mut self, session_id: i64) -> Result<()> {
        self.clear_conversation(session_id)?;
        self.conn
            .execute("DELETE FROM user_sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    fn clear_conversation(&mut self, session_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM user_conversations WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn count_messages(&mut self, session_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_conversations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn insert_message(
        &mut self,
        key: &PersonaKey,
        session_id: i64,
        message: &ChatMessage,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO user_conversations (user_id, persona_name, session_id, role, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                key.user_id,
                key.persona,
                session_id,
                message.role,
                message.content
            ])?;
        Ok(())
    }

    fn upsert_token_usage(&mut self, key: &PersonaKey, usage: &TokenUsage) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_persona_tokens
                 (user_id, persona_name, prompt_tokens, completion_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, persona_name) DO UPDATE SET
                 prompt_tokens = excluded.prompt_tokens,
                 completion_tokens = excluded.completion_tokens,
                 total_tokens = excluded.total_tokens",
            params![
                key.user_id,
                key.persona,
                to_i64(usage.prompt_tokens),
                to_i64(usage.completion_tokens),
                to_i64(usage.total_tokens)
            ],
        )?;
        Ok(())
    }

    fn delete_user_memories(&mut self, user_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM user_memories WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    fn delete_memory(&mut self, memory_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM user_memories WHERE id = ?1", params![memory_id])?;
        Ok(())
    }

    fn insert_memory(&mut self, memory: &PendingMemory) -> Result<i64> {
        let embedding = memory
            .embedding
            .as_ref()
            .filter(|e| !e.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO user_memories (user_id, content, source, embedding)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                memory.user_id,
                memory.content,
                memory.source.as_str(),
                embedding
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "事务回滚失败");
            }
        }
    }
}
