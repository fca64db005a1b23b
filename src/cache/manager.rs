//! CacheManager 核心：状态布局、锁、设置与人格操作、脏标记交接
//!
//! 会话 / token / 记忆相关的操作分别在 `session.rs`、`tokens.rs`、`memory.rs`
//! 中以独立的 `impl CacheManager` 块实现。
//!
//! ## 锁
//!
//! - `state: RwLock<CacheState>`：全部实体映射，只在内存操作期间短暂持有
//! - `book: Mutex<Bookkeeping>`：脏标记 + 会话临时 ID 计数器 + 记忆本地句柄计数器
//!
//! 需要同时持有时，加锁顺序固定为 `state → book`。锁中毒时直接取回内部数据继续使用，
//! 缓存操作本身不会返回错误。

use super::dirty::DirtyDelta;
use super::types::{
    ApiPreset, ChatMessage, Memory, Persona, PersonaKey, Session, Settings, TokenUsage,
};
use crate::config::{DEFAULT_PERSONA, SettingsDefaults};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

// ── 内部状态 ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) settings: HashMap<i64, Settings>,
    /// user_id → (persona_name → Persona)，BTreeMap 保证按名称有序
    pub(crate) personas: HashMap<i64, BTreeMap<String, Persona>>,
    /// 每个人格的会话列表，按创建顺序排列，最后一个即"最近"
    pub(crate) sessions: HashMap<PersonaKey, Vec<Session>>,
    /// session_id → 所属人格，按 ID 查会话时避免全表扫描
    pub(crate) session_owners: HashMap<i64, PersonaKey>,
    pub(crate) conversations: HashMap<i64, Vec<ChatMessage>>,
    /// user_id → (persona_name → 用量)
    pub(crate) tokens: HashMap<i64, BTreeMap<String, TokenUsage>>,
    pub(crate) memories: HashMap<i64, Vec<Memory>>,
}

#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
    pub(crate) dirty: DirtyDelta,
    /// 最近一次分配出去的会话 ID
    pub(crate) last_session_id: i64,
    pub(crate) last_memory_local: u64,
}

impl Bookkeeping {
    pub(crate) fn next_session_id(&mut self) -> i64 {
        self.last_session_id += 1;
        self.last_session_id
    }

    pub(crate) fn next_memory_local(&mut self) -> u64 {
        self.last_memory_local += 1;
        self.last_memory_local
    }
}

impl CacheState {
    pub(crate) fn is_initialized(&self, user_id: i64) -> bool {
        self.settings.contains_key(&user_id)
            && self
                .personas
                .get(&user_id)
                .is_some_and(|p| p.contains_key(DEFAULT_PERSONA))
    }

    /// 首次访问：按默认值创建设置与 default 人格并打上脏标记，已存在则什么都不做
    pub(crate) fn ensure_user(
        &mut self,
        user_id: i64,
        defaults: &SettingsDefaults,
        book: &mut Bookkeeping,
    ) {
        if !self.settings.contains_key(&user_id) {
            self.settings
                .insert(user_id, Settings::from_defaults(defaults));
            book.dirty.settings.insert(user_id);
            debug!(user_id, "新用户，已创建默认设置");
        }
        self.ensure_persona(user_id, DEFAULT_PERSONA, &defaults.system_prompt, book);
    }

    /// 人格不存在时以给定提示词创建；返回它此前是否已存在
    pub(crate) fn ensure_persona(
        &mut self,
        user_id: i64,
        name: &str,
        system_prompt: &str,
        book: &mut Bookkeeping,
    ) -> bool {
        let personas = self.personas.entry(user_id).or_default();
        if personas.contains_key(name) {
            return true;
        }
        personas.insert(name.to_string(), Persona::new(name, system_prompt));
        book.dirty.personas.insert(PersonaKey::new(user_id, name));
        false
    }

    pub(crate) fn persona_mut(&mut self, key: &PersonaKey) -> Option<&mut Persona> {
        self.personas
            .get_mut(&key.user_id)
            .and_then(|p| p.get_mut(&key.persona))
    }

    pub(crate) fn persona_ref(&self, key: &PersonaKey) -> Option<&Persona> {
        self.personas
            .get(&key.user_id)
            .and_then(|p| p.get(&key.persona))
    }

    /// 会话 `id` 是否存在且属于 `key`
    pub(crate) fn session_belongs_to(&self, id: i64, key: &PersonaKey) -> bool {
        self.session_owners.get(&id) == Some(key)
    }

    pub(crate) fn token_ref(&self, key: &PersonaKey) -> Option<&TokenUsage> {
        self.tokens
            .get(&key.user_id)
            .and_then(|t| t.get(&key.persona))
    }

    pub(crate) fn token_entry(&mut self, key: &PersonaKey) -> &mut TokenUsage {
        self.tokens
            .entry(key.user_id)
            .or_default()
            .entry(key.persona.clone())
            .or_default()
    }

    pub(crate) fn session_ref(&self, id: i64) -> Option<&Session> {
        let key = self.session_owners.get(&id)?;
        self.sessions.get(key)?.iter().find(|s| s.id == id)
    }

    pub(crate) fn session_mut(&mut self, id: i64) -> Option<&mut Session> {
        let key = self.session_owners.get(&id)?;
        self.sessions.get_mut(key)?.iter_mut().find(|s| s.id == id)
    }
}

// ── CacheManager ─────────────────────────────────────────────────────────────

/// 进程内的权威状态存储
///
/// 显式构造后以 `Arc<CacheManager>` 共享给请求处理方与 [`SyncEngine`](crate::sync::SyncEngine)。
/// 所有读操作返回克隆；所有写操作都是全函数，非法输入以 `false` / `None` 表示。
///
/// ```rust
/// use persona_cache::cache::CacheManager;
/// use persona_cache::config::SettingsDefaults;
///
/// let cache = CacheManager::new(SettingsDefaults::default());
/// let settings = cache.get_settings(42);
/// assert_eq!(settings.current_persona, "default");
/// assert!(cache.persona(42, "default").is_some());
/// ```
#[derive(Debug)]
pub struct CacheManager {
    pub(crate) defaults: SettingsDefaults,
    state: RwLock<CacheState>,
    book: Mutex<Bookkeeping>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(SettingsDefaults::default())
    }
}

impl CacheManager {
    pub fn new(defaults: SettingsDefaults) -> Self {
        Self {
            defaults,
            state: RwLock::new(CacheState::default()),
            book: Mutex::new(Bookkeeping::default()),
        }
    }

    pub fn defaults(&self) -> &SettingsDefaults {
        &self.defaults
    }

    // ── 锁辅助 ──

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在用户已初始化的前提下执行只读闭包；首次访问会先升级为写锁完成初始化
    pub(crate) fn read_user<R>(&self, user_id: i64, f: impl FnOnce(&CacheState) -> R) -> R {
        {
            let state = self.read();
            if state.is_initialized(user_id) {
                return f(&state);
            }
        }
        let mut state = self.write();
        {
            let mut book = self.book();
            state.ensure_user(user_id, &self.defaults, &mut book);
        }
        f(&state)
    }

    /// 在用户已初始化的前提下执行写闭包，同时持有状态写锁与簿记锁
    pub(crate) fn write_user<R>(
        &self,
        user_id: i64,
        f: impl FnOnce(&mut CacheState, &mut Bookkeeping) -> R,
    ) -> R {
        let mut state = self.write();
        let mut book = self.book();
        state.ensure_user(user_id, &self.defaults, &mut book);
        f(&mut state, &mut book)
    }

    /// 不涉及特定用户的写操作（按会话 ID 寻址等）
    pub(crate) fn write_all<R>(&self, f: impl FnOnce(&mut CacheState, &mut Bookkeeping) -> R) -> R {
        let mut state = self.write();
        let mut book = self.book();
        f(&mut state, &mut book)
    }

    // ── Settings ──

    /// 读取用户设置；首次访问时创建默认设置与 default 人格
    pub fn get_settings(&self, user_id: i64) -> Settings {
        self.read_user(user_id, |state| {
            state
                .settings
                .get(&user_id)
                .cloned()
                .unwrap_or_else(|| Settings::from_defaults(&self.defaults))
        })
    }

    /// 以闭包修改设置并标记脏
    ///
    /// ```rust
    /// # use persona_cache::cache::CacheManager;
    /// let cache = CacheManager::default();
    /// cache.update_settings(1, |s| s.model = "gpt-4o-mini".to_string());
    /// assert_eq!(cache.get_settings(1).model, "gpt-4o-mini");
    /// ```
    pub fn update_settings(&self, user_id: i64, f: impl FnOnce(&mut Settings)) {
        self.write_user(user_id, |state, book| {
            if let Some(settings) = state.settings.get_mut(&user_id) {
                f(settings);
                book.dirty.settings.insert(user_id);
            }
        });
    }

    pub fn current_persona_name(&self, user_id: i64) -> String {
        self.get_settings(user_id).current_persona
    }

    /// 切换当前人格；人格不存在时返回 `false` 且不做修改
    pub fn set_current_persona(&self, user_id: i64, name: &str) -> bool {
        self.write_user(user_id, |state, book| {
            if state.persona_ref(&PersonaKey::new(user_id, name)).is_none() {
                return false;
            }
            if let Some(settings) = state.settings.get_mut(&user_id) {
                settings.current_persona = name.to_string();
                book.dirty.settings.insert(user_id);
            }
            true
        })
    }

    pub fn token_limit(&self, user_id: i64) -> u64 {
        self.get_settings(user_id).token_limit
    }

    pub fn set_token_limit(&self, user_id: i64, limit: u64) {
        self.update_settings(user_id, |s| s.token_limit = limit);
    }

    /// 按提供方名称查找 API 预设，名称大小写不敏感
    pub fn api_preset(&self, user_id: i64, provider: &str) -> Option<ApiPreset> {
        self.read_user(user_id, |state| {
            state.settings.get(&user_id).and_then(|s| {
                s.api_presets
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(provider))
                    .map(|(_, preset)| preset.clone())
            })
        })
    }

    /// 加载用：整体替换设置，不标记脏
    pub fn set_settings(&self, user_id: i64, settings: Settings) {
        self.write().settings.insert(user_id, settings);
    }

    // ── Personas ──

    /// 用户的全部人格，按名称排序
    pub fn personas(&self, user_id: i64) -> Vec<Persona> {
        self.read_user(user_id, |state| {
            state
                .personas
                .get(&user_id)
                .map(|p| p.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn persona(&self, user_id: i64, name: &str) -> Option<Persona> {
        self.read_user(user_id, |state| {
            state.persona_ref(&PersonaKey::new(user_id, name)).cloned()
        })
    }

    pub fn persona_count(&self, user_id: i64) -> usize {
        self.read_user(user_id, |state| {
            state.personas.get(&user_id).map_or(0, BTreeMap::len)
        })
    }

    /// 当前人格；当前人格名悬空时回退到 default
    pub fn current_persona(&self, user_id: i64) -> Persona {
        self.read_user(user_id, |state| {
            let personas = state.personas.get(&user_id);
            let current = state
                .settings
                .get(&user_id)
                .map(|s| s.current_persona.as_str())
                .unwrap_or(DEFAULT_PERSONA);
            personas
                .and_then(|p| p.get(current).or_else(|| p.get(DEFAULT_PERSONA)))
                .cloned()
                .unwrap_or_else(|| Persona::new(DEFAULT_PERSONA, &self.defaults.system_prompt))
        })
    }

    /// 创建人格；同名人格已存在时返回 `false`
    pub fn create_persona(&self, user_id: i64, name: &str, system_prompt: &str) -> bool {
        self.write_user(user_id, |state, book| {
            !state.ensure_persona(user_id, name, system_prompt, book)
        })
    }

    pub fn update_persona_prompt(&self, user_id: i64, name: &str, system_prompt: &str) -> bool {
        self.write_user(user_id, |state, book| {
            let key = PersonaKey::new(user_id, name);
            match state.persona_mut(&key) {
                Some(persona) => {
                    persona.system_prompt = system_prompt.to_string();
                    book.dirty.personas.insert(key);
                    true
                }
                None => false,
            }
        })
    }

    /// 切换到指定人格，不存在时以默认提示词创建；返回人格此前是否已存在
    pub fn switch_persona(&self, user_id: i64, name: &str) -> bool {
        self.write_user(user_id, |state, book| {
            let existed =
                state.ensure_persona(user_id, name, &self.defaults.system_prompt, book);
            if let Some(settings) = state.settings.get_mut(&user_id) {
                settings.current_persona = name.to_string();
                book.dirty.settings.insert(user_id);
            }
            existed
        })
    }

    /// 删除人格并级联删除其会话、对话与 token 统计
    ///
    /// default 与不存在的人格返回 `false`。被删人格若是当前人格，切回 default。
    pub fn delete_persona(&self, user_id: i64, name: &str) -> bool {
        if name == DEFAULT_PERSONA {
            return false;
        }
        self.write_user(user_id, |state, book| {
            let key = PersonaKey::new(user_id, name);
            let removed = state
                .personas
                .get_mut(&user_id)
                .and_then(|p| p.remove(name));
            if removed.is_none() {
                return false;
            }

            for session in state.sessions.remove(&key).unwrap_or_default() {
                state.session_owners.remove(&session.id);
                state.conversations.remove(&session.id);
                // 整个人格的行会被级联删除，单个会话的标记都不再需要
                book.dirty.forget_session(session.id);
            }
            if let Some(buckets) = state.tokens.get_mut(&user_id) {
                buckets.remove(name);
            }

            book.dirty.personas.remove(&key);
            book.dirty.tokens.remove(&key);
            book.dirty.deleted_personas.insert(key);

            if let Some(settings) = state.settings.get_mut(&user_id) {
                if settings.current_persona == name {
                    settings.current_persona = DEFAULT_PERSONA.to_string();
                    book.dirty.settings.insert(user_id);
                }
            }
            info!(user_id, persona = name, "🗑️ 人格已删除");
            true
        })
    }

    /// 加载用：写入人格，不标记脏
    pub fn set_persona(&self, user_id: i64, persona: Persona) {
        self.write()
            .personas
            .entry(user_id)
            .or_default()
            .insert(persona.name.clone(), persona);
    }

    // ── 脏标记交接 ──

    /// 原子地取走全部脏标记
    pub fn drain(&self) -> DirtyDelta {
        self.book().dirty.take()
    }

    /// 同步失败后把取走的标记合并回来
    pub fn restore_dirty(&self, delta: DirtyDelta) {
        self.book().dirty.merge(delta);
    }

    pub fn is_dirty(&self) -> bool {
        !self.book().dirty.is_empty()
    }

    /// 当前脏标记的拷贝（不清空）
    pub fn dirty_snapshot(&self) -> DirtyDelta {
        self.book().dirty.clone()
    }

    // ── 同步引擎使用的只读窥视，不触发惰性创建 ──

    pub(crate) fn peek_settings(&self, user_id: i64) -> Option<Settings> {
        self.read().settings.get(&user_id).cloned()
    }

    /// 读取人格用于落库：指针经 `inserted`（本轮刚插入的 临时ID → 存储ID）换成存储 ID；
    /// 指向已失效或仍待插入的会话时写 `None`
    pub(crate) fn peek_persona_for_store(
        &self,
        key: &PersonaKey,
        inserted: &HashMap<i64, i64>,
    ) -> Option<Persona> {
        let state = self.read();
        let mut persona = state.persona_ref(key)?.clone();
        let pointer = persona
            .current_session_id
            .filter(|id| state.session_belongs_to(*id, key));
        persona.current_session_id = match pointer {
            Some(id) => match inserted.get(&id) {
                Some(store_id) => Some(*store_id),
                None => {
                    let book = self.book();
                    let pending = book
                        .dirty
                        .new_sessions
                        .iter()
                        .any(|p| p.provisional_id == id);
                    (!pending).then_some(id)
                }
            },
            None => None,
        };
        Some(persona)
    }

    pub(crate) fn peek_conversation(&self, session_id: i64) -> Option<Vec<ChatMessage>> {
        self.read().conversations.get(&session_id).cloned()
    }

    pub(crate) fn peek_token_usage(&self, key: &PersonaKey) -> Option<TokenUsage> {
        self.read().token_ref(key).copied()
    }

    pub(crate) fn holds_memory(&self, user_id: i64, local_id: u64) -> bool {
        self.read()
            .memories
            .get(&user_id)
            .is_some_and(|m| m.iter().any(|mem| mem.local_id == local_id))
    }

    /// 当前指针指向 `session_id` 的人格
    pub(crate) fn persona_pointing_at(&self, session_id: i64) -> Option<PersonaKey> {
        let state = self.read();
        let key = state.session_owners.get(&session_id)?;
        let persona = state.persona_ref(key)?;
        (persona.current_session_id == Some(session_id)).then(|| key.clone())
    }

    // ── 落库后的协调 ──

    /// 把已落库会话的临时 ID 改写为存储 ID
    ///
    /// 先把计数器推进到不小于所有存储 ID，保证之后分配的临时 ID 不会与它们冲突；
    /// 目标 ID 若已被另一个（更晚创建的）临时会话占用，先把占用者换到新分配的 ID。
    pub(crate) fn apply_session_ids(&self, pairs: &[(i64, i64)]) {
        let mut state = self.write();
        let mut book = self.book();

        if let Some(max_store_id) = pairs.iter().map(|(_, db)| *db).max() {
            book.last_session_id = book.last_session_id.max(max_store_id);
        }

        let mut pending: Vec<(i64, i64)> = pairs.to_vec();
        for i in 0..pending.len() {
            let (from, to) = pending[i];
            if from == to {
                continue;
            }
            if state.session_owners.contains_key(&to) {
                let fresh = book.next_session_id();
                rekey_session(&mut state, &mut book, to, fresh);
                for later in pending.iter_mut().skip(i + 1) {
                    if later.0 == to {
                        later.0 = fresh;
                    }
                }
                debug!(from = to, to = fresh, "临时会话 ID 与存储 ID 冲突，已让位");
            }
            rekey_session(&mut state, &mut book, from, to);
        }
    }

    /// 清除对已不存在会话的全部标记（本轮同步中被跳过的待插入会话）
    pub(crate) fn discard_session_markers(&self, ids: &[i64]) {
        let mut book = self.book();
        for id in ids {
            book.dirty.forget_session(*id);
        }
    }

    // ── 加载 ──

    /// 把会话计数器推进到至少 `max_id`
    pub fn seed_session_counter(&self, max_id: i64) {
        let mut book = self.book();
        book.last_session_id = book.last_session_id.max(max_id);
    }
}

/// 把会话 `from` 的所有引用改写为 `to`：会话列表、所属索引、对话、人格指针与活标记
fn rekey_session(state: &mut CacheState, book: &mut Bookkeeping, from: i64, to: i64) {
    if let Some(key) = state.session_owners.remove(&from) {
        if let Some(session) = state
            .sessions
            .get_mut(&key)
            .and_then(|list| list.iter_mut().find(|s| s.id == from))
        {
            session.id = to;
        }
        if let Some(persona) = state.persona_mut(&key) {
            if persona.current_session_id == Some(from) {
                persona.current_session_id = Some(to);
            }
        }
        state.session_owners.insert(to, key);
    }
    if let Some(messages) = state.conversations.remove(&from) {
        state.conversations.insert(to, messages);
    }
    book.dirty.rekey_session(from, to);
}
