//! 缓存实体类型

use crate::config::{DEFAULT_PERSONA, SettingsDefaults};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── 复合键 ────────────────────────────────────────────────────────────────────

/// `(user_id, persona_name)` 复合键，人格、会话列表与 token 统计都按它分桶
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonaKey {
    pub user_id: i64,
    pub persona: String,
}

impl PersonaKey {
    pub fn new(user_id: i64, persona: impl Into<String>) -> Self {
        Self {
            user_id,
            persona: persona.into(),
        }
    }
}

impl fmt::Display for PersonaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.persona)
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// 命名的 API 凭据预设（`provider -> preset`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPreset {
    pub api_key: String,
    pub base_url: String,
    #[serde(default)]
    pub model: String,
}

/// 用户全局设置，每个用户一份，首次访问时按默认值创建，永不删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    /// 全局 token 上限，0 表示不限制
    pub token_limit: u64,
    pub current_persona: String,
    pub enabled_tools: Vec<String>,
    pub tts_voice: String,
    pub tts_style: String,
    pub tts_endpoint: String,
    pub api_presets: BTreeMap<String, ApiPreset>,
    /// 会话标题生成模型，格式 `provider:model` 或 `model`，空串表示沿用当前模型
    pub title_model: String,
}

impl Settings {
    pub fn from_defaults(defaults: &SettingsDefaults) -> Self {
        Self {
            api_key: defaults.api_key.clone(),
            base_url: defaults.base_url.clone(),
            model: defaults.model.clone(),
            temperature: defaults.temperature,
            token_limit: 0,
            current_persona: DEFAULT_PERSONA.to_string(),
            enabled_tools: defaults.enabled_tools.clone(),
            tts_voice: defaults.tts_voice.clone(),
            tts_style: defaults.tts_style.clone(),
            tts_endpoint: defaults.tts_endpoint.clone(),
            api_presets: BTreeMap::new(),
            title_model: String::new(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// 工具列表的持久化形式（逗号分隔）
    pub fn enabled_tools_string(&self) -> String {
        self.enabled_tools.join(",")
    }
}

/// 解析逗号分隔的工具列表，忽略空项与首尾空白
pub fn split_tool_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ── Persona / Session ────────────────────────────────────────────────────────

/// 人格：系统提示词 + 当前会话指针
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    /// 当前会话 ID；可能悬空，由 `ensure_current_session` 惰性修复
    pub current_session_id: Option<i64>,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            current_session_id: None,
        }
    }
}

/// 人格下的一条对话线程，与一份 Conversation 一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// 落库前为本地临时 ID，落库后为存储分配的 ID
    pub id: i64,
    pub user_id: i64,
    pub persona_name: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> PersonaKey {
        PersonaKey::new(self.user_id, self.persona_name.clone())
    }
}

/// 对话记录中的单条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user` / `assistant` / `system` / `tool`
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

// ── Token 统计 ───────────────────────────────────────────────────────────────

/// 按 `(user, persona)` 累计的 token 用量，跨会话保留
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// 计数上限：存储列为有符号 64 位整数
    pub const MAX: u64 = i64::MAX as u64;

    /// 累加用量，各计数在 [`TokenUsage::MAX`] 处饱和
    pub fn add(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens = capped_add(self.prompt_tokens, prompt_tokens);
        self.completion_tokens = capped_add(self.completion_tokens, completion_tokens);
        self.total_tokens = capped_add(
            self.total_tokens,
            prompt_tokens.saturating_add(completion_tokens),
        );
    }
}

fn capped_add(a: u64, b: u64) -> u64 {
    a.saturating_add(b).min(TokenUsage::MAX)
}

// ── Memory ───────────────────────────────────────────────────────────────────

/// 记忆来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// 用户手动添加
    User,
    /// AI 自动提取
    Ai,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::User => "user",
            MemorySource::Ai => "ai",
        }
    }

    /// 未知取值按 `User` 处理
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("ai") {
            MemorySource::Ai
        } else {
            MemorySource::User
        }
    }
}

/// 用户记忆，所有人格共享
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// 存储分配的 ID，落库前为 `None`
    pub id: Option<i64>,
    /// 进程内句柄，用于落库后回写 `id`
    pub local_id: u64,
    pub user_id: i64,
    pub content: String,
    pub source: MemorySource,
    pub embedding: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_defaults() {
        let settings = Settings::from_defaults(&SettingsDefaults::default());
        assert_eq!(settings.token_limit, 0);
        assert_eq!(settings.current_persona, "default");
        assert!(settings.api_presets.is_empty());
        assert!(!settings.has_api_key());
        assert_eq!(settings.enabled_tools_string(), "memory,search,fetch,wikipedia,tts");
    }

    #[test]
    fn test_token_usage_is_additive() {
        let mut usage = TokenUsage::default();
        usage.add(10, 5);
        usage.add(1, 2);
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 18);
    }

    #[test]
    fn test_memory_source_parse() {
        assert_eq!(MemorySource::parse("ai"), MemorySource::Ai);
        assert_eq!(MemorySource::parse("AI"), MemorySource::Ai);
        assert_eq!(MemorySource::parse("user"), MemorySource::User);
        assert_eq!(MemorySource::parse("???"), MemorySource::User);
    }
}
