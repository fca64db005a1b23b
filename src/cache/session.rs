//! 会话与对话
//!
//! 所有对话读写都经过 [`CacheManager::ensure_current_session`]，保证消息永远不会
//! 追加到已删除或不存在的会话上。位置参数（`switch_session` / `delete_session`）
//! 从 1 开始计数。

use super::dirty::PendingSession;
use super::manager::{Bookkeeping, CacheManager, CacheState};
use super::types::{ChatMessage, PersonaKey, Session};
use crate::config::SettingsDefaults;
use chrono::Utc;
use tracing::debug;

impl CacheState {
    /// 人格的当前会话指针，仅当它指向该人格的一个存活会话时返回
    pub(crate) fn resolve_current_session(&self, key: &PersonaKey) -> Option<i64> {
        self.persona_ref(key)?
            .current_session_id
            .filter(|id| self.session_belongs_to(*id, key))
    }

    /// 解析或修复当前会话：指针有效直接返回；否则取最近的会话；都没有则新建
    pub(crate) fn ensure_current_session(
        &mut self,
        key: &PersonaKey,
        defaults: &SettingsDefaults,
        book: &mut Bookkeeping,
    ) -> i64 {
        if let Some(id) = self.resolve_current_session(key) {
            return id;
        }
        self.ensure_persona(key.user_id, &key.persona, &defaults.system_prompt, book);
        let id = match self.sessions.get(key).and_then(|list| list.last()) {
            Some(latest) => latest.id,
            None => self.mint_session(key, None, book),
        };
        self.set_current_pointer(key, id, book);
        debug!(key = %key, session_id = id, "当前会话指针已修复");
        id
    }

    /// 分配临时 ID 并创建会话，同时登记待插入记录
    pub(crate) fn mint_session(
        &mut self,
        key: &PersonaKey,
        title: Option<String>,
        book: &mut Bookkeeping,
    ) -> i64 {
        let mut id = book.next_session_id();
        while self.session_owners.contains_key(&id) {
            id = book.next_session_id();
        }
        let created_at = Utc::now();

        book.dirty.new_sessions.push(PendingSession {
            provisional_id: id,
            user_id: key.user_id,
            persona_name: key.persona.clone(),
            title: title.clone(),
            created_at,
        });
        self.sessions.entry(key.clone()).or_default().push(Session {
            id,
            user_id: key.user_id,
            persona_name: key.persona.clone(),
            title,
            created_at,
        });
        self.session_owners.insert(id, key.clone());
        self.conversations.insert(id, Vec::new());
        id
    }

    pub(crate) fn set_current_pointer(&mut self, key: &PersonaKey, id: i64, book: &mut Bookkeeping) {
        if let Some(persona) = self.persona_mut(key) {
            persona.current_session_id = Some(id);
            book.dirty.personas.insert(key.clone());
        }
    }

    /// 删除会话及其对话
    ///
    /// 仍在待插入列表中的会话直接撤回；已落库（或正在落库）的会话登记删除。
    pub(crate) fn remove_session(&mut self, id: i64, book: &mut Bookkeeping) -> bool {
        let Some(key) = self.session_owners.remove(&id) else {
            return false;
        };
        if let Some(list) = self.sessions.get_mut(&key) {
            list.retain(|s| s.id != id);
        }
        self.conversations.remove(&id);

        let was_pending = book.dirty.withdraw_pending_session(id);
        book.dirty.forget_session(id);
        if !was_pending {
            book.dirty.deleted_sessions.insert(id);
        }
        true
    }

    fn session_at(&self, key: &PersonaKey, position: usize) -> Option<i64> {
        let index = position.checked_sub(1)?;
        self.sessions.get(key)?.get(index).map(|s| s.id)
    }
}

impl CacheManager {
    /// 返回人格当前会话的 ID，必要时修复指针或新建会话
    pub fn ensure_current_session(&self, user_id: i64, persona: &str) -> i64 {
        let key = PersonaKey::new(user_id, persona);
        {
            let state = self.read();
            if state.is_initialized(user_id) {
                if let Some(id) = state.resolve_current_session(&key) {
                    return id;
                }
            }
        }
        self.write_user(user_id, |state, book| {
            state.ensure_current_session(&key, &self.defaults, book)
        })
    }

    /// 追加消息到人格的当前会话，返回实际写入的会话 ID
    pub fn add_message(&self, user_id: i64, persona: &str, role: &str, content: &str) -> i64 {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| {
            let id = state.ensure_current_session(&key, &self.defaults, book);
            state
                .conversations
                .entry(id)
                .or_default()
                .push(ChatMessage::new(role, content));
            book.dirty.conversations.insert(id);
            id
        })
    }

    /// 追加消息到指定会话；会话不存在时返回 `false`
    pub fn append_message(&self, session_id: i64, role: &str, content: &str) -> bool {
        self.write_all(|state, book| {
            if !state.session_owners.contains_key(&session_id) {
                return false;
            }
            state
                .conversations
                .entry(session_id)
                .or_default()
                .push(ChatMessage::new(role, content));
            book.dirty.conversations.insert(session_id);
            true
        })
    }

    /// 会话的消息记录；未知会话返回空列表
    pub fn conversation(&self, session_id: i64) -> Vec<ChatMessage> {
        self.read()
            .conversations
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn current_conversation(&self, user_id: i64, persona: &str) -> Vec<ChatMessage> {
        let id = self.ensure_current_session(user_id, persona);
        self.conversation(id)
    }

    /// 清空会话消息；未知会话返回 `false`
    pub fn clear_conversation(&self, session_id: i64) -> bool {
        self.write_all(|state, book| {
            if !state.session_owners.contains_key(&session_id) {
                return false;
            }
            state.conversations.insert(session_id, Vec::new());
            book.dirty.conversations.remove(&session_id);
            book.dirty.cleared_conversations.insert(session_id);
            true
        })
    }

    pub fn message_count(&self, session_id: i64) -> usize {
        self.read()
            .conversations
            .get(&session_id)
            .map_or(0, Vec::len)
    }

    // ── 会话管理 ──

    /// 人格的全部会话，按创建顺序
    pub fn sessions(&self, user_id: i64, persona: &str) -> Vec<Session> {
        let key = PersonaKey::new(user_id, persona);
        self.read_user(user_id, |state| {
            state.sessions.get(&key).cloned().unwrap_or_default()
        })
    }

    pub fn session_count(&self, user_id: i64, persona: &str) -> usize {
        let key = PersonaKey::new(user_id, persona);
        self.read_user(user_id, |state| state.sessions.get(&key).map_or(0, Vec::len))
    }

    pub fn session(&self, session_id: i64) -> Option<Session> {
        self.read().session_ref(session_id).cloned()
    }

    /// 当前会话 ID；指针为空或已悬空时返回 `None`（不修复）
    pub fn current_session_id(&self, user_id: i64, persona: &str) -> Option<i64> {
        let key = PersonaKey::new(user_id, persona);
        self.read_user(user_id, |state| state.resolve_current_session(&key))
    }

    pub fn current_session(&self, user_id: i64, persona: &str) -> Option<Session> {
        let key = PersonaKey::new(user_id, persona);
        self.read_user(user_id, |state| {
            state
                .resolve_current_session(&key)
                .and_then(|id| state.session_ref(id))
                .cloned()
        })
    }

    /// 新建会话并设为当前会话；人格不存在时以默认提示词创建
    pub fn create_session(&self, user_id: i64, persona: &str, title: Option<&str>) -> Session {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| {
            state.ensure_persona(user_id, persona, &self.defaults.system_prompt, book);
            let id = state.mint_session(&key, title.map(String::from), book);
            state.set_current_pointer(&key, id, book);
            state
                .session_ref(id)
                .cloned()
                .unwrap_or_else(|| Session {
                    id,
                    user_id,
                    persona_name: persona.to_string(),
                    title: title.map(String::from),
                    created_at: Utc::now(),
                })
        })
    }

    /// 按 1 起始的位置切换会话
    pub fn switch_session(&self, user_id: i64, persona: &str, position: usize) -> bool {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| match state.session_at(&key, position) {
            Some(id) => {
                state.set_current_pointer(&key, id, book);
                true
            }
            None => false,
        })
    }

    /// 按 1 起始的位置删除会话
    ///
    /// 删除的是当前会话时，切到剩余会话中最近的一个；没有剩余会话则新建一个。
    pub fn delete_session(&self, user_id: i64, persona: &str, position: usize) -> bool {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| {
            let Some(id) = state.session_at(&key, position) else {
                return false;
            };
            let was_current = state.resolve_current_session(&key) == Some(id);
            state.remove_session(id, book);
            if was_current {
                state.ensure_current_session(&key, &self.defaults, book);
            }
            true
        })
    }

    /// 修改会话标题；未知会话返回 `false`
    pub fn rename_session(&self, session_id: i64, title: &str) -> bool {
        self.write_all(|state, book| match state.session_mut(session_id) {
            Some(session) => {
                session.title = Some(title.to_string());
                // 待插入的会话落库时直接带上最新标题
                let pending = book
                    .dirty
                    .new_sessions
                    .iter()
                    .any(|p| p.provisional_id == session_id);
                if !pending {
                    book.dirty.renamed_sessions.insert(session_id);
                }
                true
            }
            None => false,
        })
    }

    /// 修改当前会话标题；没有有效的当前会话时返回 `false`
    pub fn rename_current_session(&self, user_id: i64, persona: &str, title: &str) -> bool {
        match self.current_session_id(user_id, persona) {
            Some(id) => self.rename_session(id, title),
            None => false,
        }
    }

    // ── 加载 ──

    /// 加载用：替换人格的会话列表（应按 ID 升序），不标记脏
    pub fn set_sessions(&self, user_id: i64, persona: &str, sessions: Vec<Session>) {
        let key = PersonaKey::new(user_id, persona);
        let max_id = sessions.iter().map(|s| s.id).max().unwrap_or(0);
        {
            let mut state = self.write();
            if let Some(old) = state.sessions.remove(&key) {
                for session in old {
                    state.session_owners.remove(&session.id);
                }
            }
            for session in &sessions {
                state.session_owners.insert(session.id, key.clone());
            }
            state.sessions.insert(key, sessions);
        }
        self.seed_session_counter(max_id);
    }

    /// 加载用：替换会话的消息记录，不标记脏
    pub fn set_conversation(&self, session_id: i64, messages: Vec<ChatMessage>) {
        self.write().conversations.insert(session_id, messages);
    }
}
