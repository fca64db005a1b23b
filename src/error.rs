use std::fmt;

/// persona-cache 的统一错误类型
///
/// 只有存储、同步与配置层会返回错误；缓存本身的读写操作全部是"全函数"，
/// 非法输入返回 `false` / `None` / 空结果。
#[derive(Debug)]
pub enum CacheError {
    /// 后备存储错误
    Store(StoreError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// 后备存储错误
#[derive(Debug)]
pub enum StoreError {
    /// SQL 执行失败
    Query(String),
    /// 列值序列化/反序列化失败（JSON 列等）
    Serialization(String),
    /// 连接锁中毒
    Lock(String),
    /// 存储不可用（测试替身注入的故障也归入此类）
    Unavailable(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Store(e) => write!(f, "Store Error: {}", e),
            CacheError::Config(e) => write!(f, "Config Error: {}", e),
            CacheError::Io(e) => write!(f, "IO Error: {}", e),
            CacheError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Query(msg) => write!(f, "Query failed: {}", msg),
            StoreError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StoreError::Lock(msg) => write!(f, "Connection lock poisoned: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Store(e) => Some(e),
            CacheError::Config(e) => Some(e),
            CacheError::Io(e) => Some(e),
            CacheError::Other(_) => None,
        }
    }
}

impl std::error::Error for StoreError {}
impl std::error::Error for ConfigError {}

// From 转换实现
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Store(StoreError::Query(err.to_string()))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Store(StoreError::Serialization(err.to_string()))
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Store(err)
    }
}

impl From<ConfigError> for CacheError {
    fn from(err: ConfigError) -> Self {
        CacheError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, CacheError>;
