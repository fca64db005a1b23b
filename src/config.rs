//! 运行配置加载
//!
//! 两种来源：
//! - 环境变量（启动时先读取 `.env`）：
//!   ```text
//!   OPENAI_API_KEY=sk-...
//!   OPENAI_BASE_URL=https://api.openai.com/v1
//!   OPENAI_MODEL=gpt-4o
//!   OPENAI_TEMPERATURE=0.7
//!   OPENAI_SYSTEM_PROMPT=You are a helpful assistant.
//!   ENABLED_TOOLS=memory,search,fetch,wikipedia,tts
//!   TTS_VOICE / TTS_STYLE / TTS_ENDPOINT
//!   DATABASE_PATH=persona-cache.db
//!   DB_SYNC_INTERVAL=30
//!   ```
//! - YAML 文件（[`CacheConfig::load`]），字段名与结构体一致，缺省字段取默认值。

use crate::cache::types::split_tool_list;
use crate::error::{ConfigError, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认人格名，每个用户都有且不可删除
pub const DEFAULT_PERSONA: &str = "default";

/// 后台同步周期（秒）
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_ENABLED_TOOLS: &str = "memory,search,fetch,wikipedia,tts";
const DEFAULT_TTS_VOICE: &str = "zh-CN-XiaoxiaoMultilingualNeural";
const DEFAULT_TTS_STYLE: &str = "general";
const DEFAULT_DATABASE_PATH: &str = "persona-cache.db";

/// 新用户首次访问时使用的默认设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettingsDefaults {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    /// 新建人格（包括 default）使用的系统提示词
    pub system_prompt: String,
    pub enabled_tools: Vec<String>,
    pub tts_voice: String,
    pub tts_style: String,
    pub tts_endpoint: String,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            enabled_tools: split_tool_list(DEFAULT_ENABLED_TOOLS),
            tts_voice: DEFAULT_TTS_VOICE.to_string(),
            tts_style: DEFAULT_TTS_STYLE.to_string(),
            tts_endpoint: String::new(),
        }
    }
}

impl SettingsDefaults {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意查找函数构造，未设置的变量保持默认值
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut defaults = Self::default();
        if let Some(v) = lookup("OPENAI_API_KEY") {
            defaults.api_key = v;
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            defaults.base_url = v;
        }
        if let Some(v) = lookup("OPENAI_MODEL") {
            defaults.model = v;
        }
        if let Some(v) = lookup("OPENAI_TEMPERATURE") {
            defaults.temperature =
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| ConfigError::InvalidValue {
                        field: "OPENAI_TEMPERATURE".to_string(),
                        message: e.to_string(),
                    })?;
        }
        if let Some(v) = lookup("OPENAI_SYSTEM_PROMPT") {
            defaults.system_prompt = v;
        }
        if let Some(v) = lookup("ENABLED_TOOLS") {
            defaults.enabled_tools = split_tool_list(&v);
        }
        if let Some(v) = lookup("TTS_VOICE") {
            defaults.tts_voice = v;
        }
        if let Some(v) = lookup("TTS_STYLE") {
            defaults.tts_style = v;
        }
        if let Some(v) = lookup("TTS_ENDPOINT") {
            defaults.tts_endpoint = v;
        }
        Ok(defaults)
    }
}

/// 进程级配置：数据库位置、同步周期以及新用户默认设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite 数据库文件路径
    pub database_path: String,
    /// 后台同步周期（秒）
    pub sync_interval_secs: u64,
    pub defaults: SettingsDefaults,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            defaults: SettingsDefaults::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            defaults: SettingsDefaults::from_lookup(&lookup)?,
            ..Self::default()
        };
        if let Some(v) = lookup("DATABASE_PATH") {
            config.database_path = v;
        }
        if let Some(v) = lookup("DB_SYNC_INTERVAL") {
            config.sync_interval_secs = parse_interval(&v)?;
        }
        Ok(config)
    }

    /// 从 YAML 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: CacheConfig = serde_yaml::from_reader(file)?;
        if config.sync_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync_interval_secs".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn parse_interval(raw: &str) -> Result<u64> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            field: "DB_SYNC_INTERVAL".to_string(),
            message: e.to_string(),
        })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "DB_SYNC_INTERVAL".to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = CacheConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.defaults.model, "gpt-4o");
        assert_eq!(
            config.defaults.enabled_tools,
            vec!["memory", "search", "fetch", "wikipedia", "tts"]
        );
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("OPENAI_MODEL", "qwen3-max"),
            ("OPENAI_TEMPERATURE", "0.2"),
            ("ENABLED_TOOLS", "memory, search ,,fetch"),
            ("DATABASE_PATH", "/tmp/state.db"),
            ("DB_SYNC_INTERVAL", "5"),
        ]))
        .unwrap();
        assert_eq!(config.defaults.model, "qwen3-max");
        assert!((config.defaults.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.defaults.enabled_tools, vec!["memory", "search", "fetch"]);
        assert_eq!(config.database_path, "/tmp/state.db");
        assert_eq!(config.sync_interval_secs, 5);
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let err = SettingsDefaults::from_lookup(lookup_from(&[("OPENAI_TEMPERATURE", "warm")]))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "OPENAI_TEMPERATURE"
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = CacheConfig::from_lookup(lookup_from(&[("DB_SYNC_INTERVAL", "0")])).unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_path: state.db\nsync_interval_secs: 10\ndefaults:\n  model: gpt-4o-mini\n"
        )
        .unwrap();
        let config = CacheConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.database_path, "state.db");
        assert_eq!(config.sync_interval_secs, 10);
        assert_eq!(config.defaults.model, "gpt-4o-mini");
        // 未出现的字段保持默认值
        assert_eq!(config.defaults.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_load_missing_file() {
        let err = CacheConfig::load("/nonexistent/persona-cache.yaml").unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::FileNotFound(_))));
    }
}
