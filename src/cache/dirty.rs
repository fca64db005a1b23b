//! 脏标记（dirty markers）
//!
//! 记录自上次成功落库以来发生的变化，是写前提示而非一致性证明：
//! 标记缺失并不代表存储已是最新。
//!
//! | 集合 | 形态 | 含义 |
//! |------|------|------|
//! | `settings` / `cleared_memories` | `HashSet<user_id>` | 设置变更 / 记忆整体清空 |
//! | `personas` / `deleted_personas` / `tokens` | `HashSet<PersonaKey>` | 人格变更 / 人格删除 / token 变更 |
//! | `conversations` / `cleared_conversations` / `renamed_sessions` / `deleted_sessions` | `HashSet<session_id>` | 会话相关 |
//! | `new_sessions` / `new_memories` | `Vec<Pending*>` | 待插入记录，保持创建顺序 |
//! | `deleted_memory_ids` | `Vec<i64>` | 待删除的已落库记忆 |
//!
//! 同一个 [`DirtyDelta`] 类型既是缓存内的"活"标记，也是 `drain()` 取出的快照。

use super::types::{MemorySource, PersonaKey};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// 尚未落库的会话（以临时 ID 标识）
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSession {
    pub provisional_id: i64,
    pub user_id: i64,
    pub persona_name: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingSession {
    pub fn key(&self) -> PersonaKey {
        PersonaKey::new(self.user_id, self.persona_name.clone())
    }
}

/// 尚未落库的记忆（以进程内 `local_id` 标识）
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMemory {
    pub local_id: u64,
    pub user_id: i64,
    pub content: String,
    pub source: MemorySource,
    pub embedding: Option<Vec<f32>>,
}

/// 一组脏标记
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtyDelta {
    pub settings: HashSet<i64>,
    pub personas: HashSet<PersonaKey>,
    pub deleted_personas: HashSet<PersonaKey>,
    pub new_sessions: Vec<PendingSession>,
    pub renamed_sessions: HashSet<i64>,
    pub deleted_sessions: HashSet<i64>,
    pub conversations: HashSet<i64>,
    pub cleared_conversations: HashSet<i64>,
    pub tokens: HashSet<PersonaKey>,
    pub new_memories: Vec<PendingMemory>,
    pub deleted_memory_ids: Vec<i64>,
    pub cleared_memories: HashSet<i64>,
}

impl DirtyDelta {
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
            && self.personas.is_empty()
            && self.deleted_personas.is_empty()
            && self.new_sessions.is_empty()
            && self.renamed_sessions.is_empty()
            && self.deleted_sessions.is_empty()
            && self.conversations.is_empty()
            && self.cleared_conversations.is_empty()
            && self.tokens.is_empty()
            && self.new_memories.is_empty()
            && self.deleted_memory_ids.is_empty()
            && self.cleared_memories.is_empty()
    }

    /// 取走全部标记，自身留空
    pub(crate) fn take(&mut self) -> DirtyDelta {
        std::mem::take(self)
    }

    /// 把之前取走的快照合并回来：集合取并集，列表把快照条目放在前面以保持创建顺序
    pub(crate) fn merge(&mut self, restored: DirtyDelta) {
        let DirtyDelta {
            settings,
            personas,
            deleted_personas,
            mut new_sessions,
            renamed_sessions,
            deleted_sessions,
            conversations,
            cleared_conversations,
            tokens,
            mut new_memories,
            mut deleted_memory_ids,
            cleared_memories,
        } = restored;

        self.settings.extend(settings);
        self.personas.extend(personas);
        self.deleted_personas.extend(deleted_personas);
        self.renamed_sessions.extend(renamed_sessions);
        self.deleted_sessions.extend(deleted_sessions);
        self.conversations.extend(conversations);
        self.cleared_conversations.extend(cleared_conversations);
        self.tokens.extend(tokens);
        self.cleared_memories.extend(cleared_memories);

        // 同一条待插入记录不能出现两次
        for pending in self.new_sessions.drain(..) {
            if !new_sessions
                .iter()
                .any(|p| p.provisional_id == pending.provisional_id)
            {
                new_sessions.push(pending);
            }
        }
        self.new_sessions = new_sessions;

        for pending in self.new_memories.drain(..) {
            if !new_memories.iter().any(|p| p.local_id == pending.local_id) {
                new_memories.push(pending);
            }
        }
        self.new_memories = new_memories;

        for id in self.deleted_memory_ids.drain(..) {
            if !deleted_memory_ids.contains(&id) {
                deleted_memory_ids.push(id);
            }
        }
        self.deleted_memory_ids = deleted_memory_ids;
    }

    /// 把所有引用会话 `from` 的标记改写为 `to`
    pub(crate) fn rekey_session(&mut self, from: i64, to: i64) {
        for set in [
            &mut self.renamed_sessions,
            &mut self.deleted_sessions,
            &mut self.conversations,
            &mut self.cleared_conversations,
        ] {
            if set.remove(&from) {
                set.insert(to);
            }
        }
        for pending in &mut self.new_sessions {
            if pending.provisional_id == from {
                pending.provisional_id = to;
            }
        }
    }

    /// 删除所有引用会话 `id` 的标记（包括待插入记录）
    pub(crate) fn forget_session(&mut self, id: i64) {
        self.renamed_sessions.remove(&id);
        self.deleted_sessions.remove(&id);
        self.conversations.remove(&id);
        self.cleared_conversations.remove(&id);
        self.new_sessions.retain(|p| p.provisional_id != id);
    }

    /// 撤回一条待插入会话；返回它是否仍在待插入列表中
    pub(crate) fn withdraw_pending_session(&mut self, id: i64) -> bool {
        let before = self.new_sessions.len();
        self.new_sessions.retain(|p| p.provisional_id != id);
        self.new_sessions.len() != before
    }

    /// 撤回一条待插入记忆；返回它是否仍在待插入列表中
    pub(crate) fn withdraw_pending_memory(&mut self, local_id: u64) -> bool {
        let before = self.new_memories.len();
        self.new_memories.retain(|p| p.local_id != local_id);
        self.new_memories.len() != before
    }

    pub(crate) fn withdraw_user_memories(&mut self, user_id: i64) {
        self.new_memories.retain(|p| p.user_id != user_id);
    }

    /// 人类可读的计数摘要，空集合不出现
    pub fn summary(&self) -> String {
        let counts = [
            (self.settings.len(), "settings"),
            (self.personas.len(), "personas"),
            (self.deleted_personas.len(), "deleted personas"),
            (self.new_sessions.len(), "new sessions"),
            (self.renamed_sessions.len(), "session titles"),
            (self.deleted_sessions.len(), "deleted sessions"),
            (self.conversations.len(), "conversations"),
            (self.cleared_conversations.len(), "cleared convs"),
            (self.tokens.len(), "token records"),
            (self.new_memories.len(), "new memories"),
            (self.deleted_memory_ids.len(), "deleted memories"),
            (self.cleared_memories.len(), "cleared memories"),
        ];
        counts
            .iter()
            .filter(|(n, _)| *n > 0)
            .map(|(n, label)| format!("{n} {label}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
