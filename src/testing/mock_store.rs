//! Mock 后备存储，用于在不打开真实数据库的情况下测试 [`SyncEngine`](crate::sync::SyncEngine)。
//!
//! - 内存表，带真实的事务语义：`begin` 复制一份工作表，`commit` 覆盖，`rollback` 丢弃
//! - 按操作注入一次性故障：[`fail_next`](MockStore::fail_next)
//! - 可控的 ID 序列：[`with_session_ids_from`](MockStore::with_session_ids_from)
//! - 记录所有调用：[`calls`](MockStore::calls) / [`call_count`](MockStore::call_count)
//!
//! # 示例
//!
//! ```rust
//! use persona_cache::cache::CacheManager;
//! use persona_cache::sync::SyncEngine;
//! use persona_cache::testing::{MockStore, StoreOp};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MockStore::new().with_session_ids_from(41));
//! let cache = Arc::new(CacheManager::default());
//! let engine = SyncEngine::new(cache.clone(), store.clone());
//!
//! let provisional = cache.add_message(1, "default", "user", "hi");
//! store.fail_next(StoreOp::InsertMessage);
//! assert!(!engine.sync().is_committed());
//! assert!(engine.sync().is_committed());
//!
//! assert_eq!(store.session_ids(), vec![42]);
//! assert_eq!(cache.current_session_id(1, "default"), Some(42));
//! assert_ne!(provisional, 0);
//! ```

use crate::cache::types::{ChatMessage, Persona, PersonaKey, Session, TokenUsage};
use crate::cache::PendingMemory;
use crate::error::{CacheError, Result, StoreError};
use crate::store::{
    BackingStore, MemoryRow, MessageRow, NewSessionRow, PersonaRow, SettingsRow, StoreSnapshot,
    StoreTransaction, TokenRow,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 可被记录 / 注入故障的存储操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    InitSchema,
    LoadSnapshot,
    Begin,
    UpsertSettings,
    DeletePersona,
    UpsertPersona,
    InsertSession,
    UpdateSessionTitle,
    DeleteSession,
    ClearConversation,
    CountMessages,
    InsertMessage,
    UpsertTokenUsage,
    DeleteUserMemories,
    DeleteMemory,
    InsertMemory,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    settings: BTreeMap<i64, SettingsRow>,
    personas: BTreeMap<(i64, String), Persona>,
    sessions: BTreeMap<i64, Session>,
    /// 行 ID → 消息
    messages: BTreeMap<i64, MessageRow>,
    tokens: BTreeMap<PersonaKey, TokenUsage>,
    memories: BTreeMap<i64, MemoryRow>,
    last_session_id: i64,
    last_message_id: i64,
    last_memory_id: i64,
}

impl Tables {
    fn delete_messages_of(&mut self, session_id: i64) {
        self.messages.retain(|_, row| row.session_id != session_id);
    }
}

/// 可脚本化的内存后备存储
pub struct MockStore {
    tables: Arc<Mutex<Tables>>,
    failures: Arc<Mutex<HashSet<StoreOp>>>,
    calls: Arc<Mutex<Vec<StoreOp>>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 下一个分配的会话 ID 为 `last + 1`
    pub fn with_session_ids_from(self, last: i64) -> Self {
        lock(&self.tables).last_session_id = last;
        self
    }

    /// 下一个分配的记忆 ID 为 `last + 1`
    pub fn with_memory_ids_from(self, last: i64) -> Self {
        lock(&self.tables).last_memory_id = last;
        self
    }

    /// 预置一份已持久化的数据（用于测试加载）
    pub fn with_snapshot(self, snapshot: StoreSnapshot) -> Self {
        {
            let mut tables = lock(&self.tables);
            for row in snapshot.settings {
                tables.settings.insert(row.user_id, row);
            }
            for row in snapshot.personas {
                tables
                    .personas
                    .insert((row.user_id, row.persona.name.clone()), row.persona);
            }
            for session in snapshot.sessions {
                tables.last_session_id = tables.last_session_id.max(session.id);
                tables.sessions.insert(session.id, session);
            }
            for row in snapshot.messages {
                tables.last_message_id += 1;
                let id = tables.last_message_id;
                tables.messages.insert(id, row);
            }
            for row in snapshot.tokens {
                tables.tokens.insert(row.key, row.usage);
            }
            for row in snapshot.memories {
                tables.last_memory_id = tables.last_memory_id.max(row.id);
                tables.memories.insert(row.id, row);
            }
            tables.last_session_id = tables.last_session_id.max(snapshot.max_session_id);
        }
        self
    }

    /// 下一次执行 `op` 时返回错误（一次性）
    pub fn fail_next(&self, op: StoreOp) {
        lock(&self.failures).insert(op);
    }

    /// 全部调用记录，按顺序
    pub fn calls(&self) -> Vec<StoreOp> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        lock(&self.calls).iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    // ── 已提交数据的检查 ──

    pub fn settings(&self, user_id: i64) -> Option<SettingsRow> {
        lock(&self.tables).settings.get(&user_id).cloned()
    }

    pub fn persona(&self, user_id: i64, name: &str) -> Option<Persona> {
        lock(&self.tables)
            .personas
            .get(&(user_id, name.to_string()))
            .cloned()
    }

    pub fn session(&self, session_id: i64) -> Option<Session> {
        lock(&self.tables).sessions.get(&session_id).cloned()
    }

    /// 已提交的会话 ID，升序
    pub fn session_ids(&self) -> Vec<i64> {
        lock(&self.tables).sessions.keys().copied().collect()
    }

    /// 会话的已提交消息，按插入顺序
    pub fn messages(&self, session_id: i64) -> Vec<ChatMessage> {
        lock(&self.tables)
            .messages
            .values()
            .filter(|row| row.session_id == session_id)
            .map(|row| row.message.clone())
            .collect()
    }

    pub fn token_usage(&self, key: &PersonaKey) -> Option<TokenUsage> {
        lock(&self.tables).tokens.get(key).copied()
    }

    pub fn memories(&self) -> Vec<MemoryRow> {
        lock(&self.tables).memories.values().cloned().collect()
    }

    fn record(&self, op: StoreOp) -> Result<()> {
        lock(&self.calls).push(op);
        if lock(&self.failures).remove(&op) {
            return Err(CacheError::Store(StoreError::Unavailable(format!(
                "injected failure: {op:?}"
            ))));
        }
        Ok(())
    }
}

impl BackingStore for MockStore {
    fn init_schema(&self) -> Result<()> {
        self.record(StoreOp::InitSchema)
    }

    fn load_snapshot(&self) -> Result<StoreSnapshot> {
        self.record(StoreOp::LoadSnapshot)?;
        let tables = lock(&self.tables);
        Ok(StoreSnapshot {
            settings: tables.settings.values().cloned().collect(),
            personas: tables
                .personas
                .iter()
                .map(|((user_id, _), persona)| PersonaRow {
                    user_id: *user_id,
                    persona: persona.clone(),
                })
                .collect(),
            sessions: tables.sessions.values().cloned().collect(),
            messages: tables.messages.values().cloned().collect(),
            tokens: tables
                .tokens
                .iter()
                .map(|(key, usage)| TokenRow {
                    key: key.clone(),
                    usage: *usage,
                })
                .collect(),
            memories: tables.memories.values().cloned().collect(),
            max_session_id: tables.last_session_id,
        })
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        self.record(StoreOp::Begin)?;
        let working = lock(&self.tables).clone();
        Ok(Box::new(MockTransaction {
            store: self,
            working,
        }))
    }
}

struct MockTransaction<'a> {
    store: &'a MockStore,
    working: Tables,
}

impl StoreTransaction for MockTransaction<'_> {
    fn upsert_settings(&mut self, row: &SettingsRow) -> Result<()> {
        self.store.record(StoreOp::UpsertSettings)?;
        self.working.settings.insert(row.user_id, row.clone());
        Ok(())
    }

    fn delete_persona_cascade(&mut self, key: &PersonaKey) -> Result<()> {
        self.store.record(StoreOp::DeletePersona)?;
        let doomed: Vec<i64> = self
            .working
            .sessions
            .values()
            .filter(|s| s.user_id == key.user_id && s.persona_name == key.persona)
            .map(|s| s.id)
            .collect();
        for id in doomed {
            self.working.delete_messages_of(id);
            self.working.sessions.remove(&id);
        }
        self.working
            .personas
            .remove(&(key.user_id, key.persona.clone()));
        self.working.tokens.remove(key);
        Ok(())
    }

    fn upsert_persona(&mut self, user_id: i64, persona: &Persona) -> Result<()> {
        self.store.record(StoreOp::UpsertPersona)?;
        self.working
            .personas
            .insert((user_id, persona.name.clone()), persona.clone());
        Ok(())
    }

    fn insert_session(&mut self, row: &NewSessionRow) -> Result<i64> {
        self.store.record(StoreOp::InsertSession)?;
        self.working.last_session_id += 1;
        let id = self.working.last_session_id;
        self.working.sessions.insert(
            id,
            Session {
                id,
                user_id: row.user_id,
                persona_name: row.persona_name.clone(),
                title: row.title.clone(),
                created_at: row.created_at,
            },
        );
        Ok(id)
    }

    fn update_session_title(&mut self, session_id: i64, title: Option<&str>) -> Result<()> {
        self.store.record(StoreOp::UpdateSessionTitle)?;
        if let Some(session) = self.working.sessions.get_mut(&session_id) {
            session.title = title.map(String::from);
        }
        Ok(())
    }

    fn delete_session(&mut self, session_id: i64) -> Result<()> {
        self.store.record(StoreOp::DeleteSession)?;
        self.working.delete_messages_of(session_id);
        self.working.sessions.remove(&session_id);
        Ok(())
    }

    fn clear_conversation(&mut self, session_id: i64) -> Result<()> {
        self.store.record(StoreOp::ClearConversation)?;
        self.working.delete_messages_of(session_id);
        Ok(())
    }

    fn count_messages(&mut self, session_id: i64) -> Result<usize> {
        self.store.record(StoreOp::CountMessages)?;
        Ok(self
            .working
            .messages
            .values()
            .filter(|row| row.session_id == session_id)
            .count())
    }

    fn insert_message(
        &mut self,
        _key: &PersonaKey,
        session_id: i64,
        message: &ChatMessage,
    ) -> Result<()> {
        self.store.record(StoreOp::InsertMessage)?;
        self.working.last_message_id += 1;
        let id = self.working.last_message_id;
        self.working.messages.insert(
            id,
            MessageRow {
                session_id,
                message: message.clone(),
            },
        );
        Ok(())
    }

    fn upsert_token_usage(&mut self, key: &PersonaKey, usage: &TokenUsage) -> Result<()> {
        self.store.record(StoreOp::UpsertTokenUsage)?;
        self.working.tokens.insert(key.clone(), *usage);
        Ok(())
    }

    fn delete_user_memories(&mut self, user_id: i64) -> Result<()> {
        self.store.record(StoreOp::DeleteUserMemories)?;
        self.working.memories.retain(|_, m| m.user_id != user_id);
        Ok(())
    }

    fn delete_memory(&mut self, memory_id: i64) -> Result<()> {
        self.store.record(StoreOp::DeleteMemory)?;
        self.working.memories.remove(&memory_id);
        Ok(())
    }

    fn insert_memory(&mut self, memory: &PendingMemory) -> Result<i64> {
        self.store.record(StoreOp::InsertMemory)?;
        let embedding = memory
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.working.last_memory_id += 1;
        let id = self.working.last_memory_id;
        self.working.memories.insert(
            id,
            MemoryRow {
                id,
                user_id: memory.user_id,
                content: memory.content.clone(),
                source: memory.source.as_str().to_string(),
                embedding,
            },
        );
        Ok(id)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MockTransaction { store, working } = *self;
        store.record(StoreOp::Commit)?;
        *lock(&store.tables) = working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.store.record(StoreOp::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_session() -> NewSessionRow {
        NewSessionRow {
            user_id: 1,
            persona_name: "default".to_string(),
            title: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rollback_discards_working_copy() {
        let store = MockStore::new();
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.insert_session(&new_session()).unwrap(), 1);
        tx.rollback().unwrap();
        assert!(store.session_ids().is_empty());

        // 序列号同样回滚
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.insert_session(&new_session()).unwrap(), 1);
        tx.commit().unwrap();
        assert_eq!(store.session_ids(), vec![1]);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let store = MockStore::new();
        store.fail_next(StoreOp::Begin);
        assert!(store.begin().is_err());
        assert!(store.begin().is_ok());
        assert_eq!(store.call_count(StoreOp::Begin), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = MockStore::new().with_session_ids_from(10);
        let mut tx = store.begin().unwrap();
        let id = tx.insert_session(&new_session()).unwrap();
        tx.insert_message(&PersonaKey::new(1, "default"), id, &ChatMessage::user("hi"))
            .unwrap();
        tx.commit().unwrap();

        let snapshot = store.load_snapshot().unwrap();
        assert_eq!(id, 11);
        assert_eq!(snapshot.max_session_id, 11);
        assert_eq!(snapshot.messages.len(), 1);

        let copy = MockStore::new().with_snapshot(snapshot.clone());
        assert_eq!(copy.load_snapshot().unwrap(), snapshot);
    }
}
