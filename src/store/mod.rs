//! 后备存储契约
//!
//! 同步引擎只通过这里的两个 trait 接触持久化：
//!
//! - [`BackingStore`]：建表、启动时一次性读取全部数据、开启事务
//! - [`StoreTransaction`]：同步一轮所需的全部写原语 + `commit` / `rollback`
//!
//! 事务对象在未提交的情况下被丢弃时必须回滚。
//!
//! ## 内置实现
//!
//! - [`SqliteStore`]：基于 rusqlite，生产使用
//! - [`MockStore`](crate::testing::MockStore)：内存表 + 故障注入，测试使用

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::cache::types::{
    ApiPreset, ChatMessage, Memory, MemorySource, Persona, PersonaKey, Session, Settings,
    TokenUsage, split_tool_list,
};
use crate::cache::PendingMemory;
use crate::config::SettingsDefaults;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;

// ── 行类型 ───────────────────────────────────────────────────────────────────

/// `user_settings` 表的一行，列可能为 NULL
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsRow {
    pub user_id: i64,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub token_limit: Option<i64>,
    pub current_persona: Option<String>,
    pub enabled_tools: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_style: Option<String>,
    pub tts_endpoint: Option<String>,
    /// JSON 文本
    pub api_presets: Option<String>,
    pub title_model: Option<String>,
}

impl SettingsRow {
    pub fn from_settings(user_id: i64, settings: &Settings) -> Result<Self> {
        let api_presets = if settings.api_presets.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&settings.api_presets)?)
        };
        Ok(Self {
            user_id,
            api_key: Some(settings.api_key.clone()),
            base_url: Some(settings.base_url.clone()),
            model: Some(settings.model.clone()),
            temperature: Some(settings.temperature),
            token_limit: Some(i64::try_from(settings.token_limit).unwrap_or(i64::MAX)),
            current_persona: Some(settings.current_persona.clone()),
            enabled_tools: Some(settings.enabled_tools_string()),
            tts_voice: Some(settings.tts_voice.clone()),
            tts_style: Some(settings.tts_style.clone()),
            tts_endpoint: Some(settings.tts_endpoint.clone()),
            api_presets,
            title_model: Some(settings.title_model.clone()),
        })
    }

    /// 还原为设置：空值取默认，无法解析的预设 JSON 忽略
    pub fn into_settings(self, defaults: &SettingsDefaults) -> Settings {
        let fallback = Settings::from_defaults(defaults);
        let api_presets = self
            .api_presets
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| {
                serde_json::from_str::<BTreeMap<String, ApiPreset>>(&raw)
                    .map_err(|e| warn!(user_id = self.user_id, error = %e, "api_presets 无法解析，已忽略"))
                    .ok()
            })
            .unwrap_or_default();
        Settings {
            api_key: self.api_key.unwrap_or(fallback.api_key),
            base_url: non_empty(self.base_url).unwrap_or(fallback.base_url),
            model: non_empty(self.model).unwrap_or(fallback.model),
            temperature: self.temperature.unwrap_or(fallback.temperature),
            token_limit: self
                .token_limit
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0),
            current_persona: non_empty(self.current_persona).unwrap_or(fallback.current_persona),
            enabled_tools: non_empty(self.enabled_tools)
                .map(|raw| split_tool_list(&raw))
                .unwrap_or(fallback.enabled_tools),
            tts_voice: non_empty(self.tts_voice).unwrap_or(fallback.tts_voice),
            tts_style: non_empty(self.tts_style).unwrap_or(fallback.tts_style),
            tts_endpoint: non_empty(self.tts_endpoint).unwrap_or(fallback.tts_endpoint),
            api_presets,
            title_model: self.title_model.unwrap_or_default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// `user_personas` 表的一行
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaRow {
    pub user_id: i64,
    pub persona: Persona,
}

/// `user_conversations` 表的一行
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub session_id: i64,
    pub message: ChatMessage,
}

/// `user_persona_tokens` 表的一行
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRow {
    pub key: PersonaKey,
    pub usage: TokenUsage,
}

/// `user_memories` 表的一行，embedding 为 JSON 文本
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub source: String,
    pub embedding: Option<String>,
}

impl MemoryRow {
    /// 还原为记忆；embedding 无法解析时置空
    pub fn into_memory(self) -> Memory {
        let embedding = self.embedding.and_then(|raw| {
            serde_json::from_str::<Vec<f32>>(&raw)
                .map_err(|e| warn!(memory_id = self.id, error = %e, "embedding 无法解析，已忽略"))
                .ok()
        });
        Memory {
            id: Some(self.id),
            local_id: 0,
            user_id: self.user_id,
            content: self.content,
            source: MemorySource::parse(&self.source),
            embedding,
        }
    }
}

/// 待插入的会话行
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionRow {
    pub user_id: i64,
    pub persona_name: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Session> for NewSessionRow {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id,
            persona_name: session.persona_name.clone(),
            title: session.title.clone(),
            created_at: session.created_at,
        }
    }
}

/// 启动时一次性读出的全部数据
///
/// `sessions` 按 ID 升序，`messages` 按行 ID 升序，`memories` 按 ID 升序。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub settings: Vec<SettingsRow>,
    pub personas: Vec<PersonaRow>,
    pub sessions: Vec<Session>,
    pub messages: Vec<MessageRow>,
    pub tokens: Vec<TokenRow>,
    pub memories: Vec<MemoryRow>,
    /// 存储曾分配过的最大会话 ID（含已删除的）
    pub max_session_id: i64,
}

// ── Traits ───────────────────────────────────────────────────────────────────

/// 关系型后备存储
pub trait BackingStore: Send + Sync {
    /// 建表（幂等）
    fn init_schema(&self) -> Result<()>;

    /// 读取全部持久化状态
    fn load_snapshot(&self) -> Result<StoreSnapshot>;

    /// 开启一个写事务
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;
}

/// 一次同步所用的写事务
pub trait StoreTransaction {
    /// 插入或更新用户设置
    fn upsert_settings(&mut self, row: &SettingsRow) -> Result<()>;

    /// 删除人格及其会话、对话、token 行
    fn delete_persona_cascade(&mut self, key: &PersonaKey) -> Result<()>;

    /// 插入或更新人格（`current_session_id` 必须已是存储 ID 或 `None`）
    fn upsert_persona(&mut self, user_id: i64, persona: &Persona) -> Result<()>;

    /// 插入会话，返回存储分配的 ID
    fn insert_session(&mut self, row: &NewSessionRow) -> Result<i64>;

    fn update_session_title(&mut self, session_id: i64, title: Option<&str>) -> Result<()>;

    /// 删除会话及其对话
    fn delete_session(&mut self, session_id: i64) -> Result<()>;

    /// 删除会话的全部对话行
    fn clear_conversation(&mut self, session_id: i64) -> Result<()>;

    /// 会话已持久化的消息条数
    fn count_messages(&mut self, session_id: i64) -> Result<usize>;

    fn insert_message(
        &mut self,
        key: &PersonaKey,
        session_id: i64,
        message: &ChatMessage,
    ) -> Result<()>;

    fn upsert_token_usage(&mut self, key: &PersonaKey, usage: &TokenUsage) -> Result<()>;

    fn delete_user_memories(&mut self, user_id: i64) -> Result<()>;

    fn delete_memory(&mut self, memory_id: i64) -> Result<()>;

    /// 插入记忆，返回存储分配的 ID
    fn insert_memory(&mut self, memory: &PendingMemory) -> Result<i64>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_row_null_columns_use_defaults() {
        let defaults = SettingsDefaults::default();
        let row = SettingsRow {
            user_id: 1,
            model: Some("qwen3-max".to_string()),
            api_presets: Some("{not json".to_string()),
            ..SettingsRow::default()
        };
        let settings = row.into_settings(&defaults);

        assert_eq!(settings.model, "qwen3-max");
        assert_eq!(settings.base_url, defaults.base_url);
        assert_eq!(settings.current_persona, "default");
        assert_eq!(settings.token_limit, 0);
        assert_eq!(settings.tts_voice, "zh-CN-XiaoxiaoMultilingualNeural");
        assert!(settings.api_presets.is_empty(), "无法解析的预设应被忽略");
    }

    #[test]
    fn test_settings_row_keeps_presets() {
        let defaults = SettingsDefaults::default();
        let mut settings = Settings::from_defaults(&defaults);
        settings.token_limit = 5000;
        settings.enabled_tools = vec!["memory".to_string(), "tts".to_string()];
        settings.api_presets.insert(
            "openai".to_string(),
            ApiPreset {
                api_key: "sk".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
            },
        );

        let row = SettingsRow::from_settings(9, &settings).unwrap();
        assert_eq!(row.enabled_tools.as_deref(), Some("memory,tts"));
        assert_eq!(row.into_settings(&defaults), settings);
    }

    #[test]
    fn test_empty_presets_stored_as_null() {
        let settings = Settings::from_defaults(&SettingsDefaults::default());
        let row = SettingsRow::from_settings(1, &settings).unwrap();
        assert!(row.api_presets.is_none());
    }

    #[test]
    fn test_memory_row_bad_embedding_ignored() {
        let row = MemoryRow {
            id: 3,
            user_id: 1,
            content: "likes tea".to_string(),
            source: "ai".to_string(),
            embedding: Some("[0.5, oops]".to_string()),
        };
        let memory = row.into_memory();
        assert_eq!(memory.id, Some(3));
        assert_eq!(memory.source, MemorySource::Ai);
        assert!(memory.embedding.is_none());
    }
}
