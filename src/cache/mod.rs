//! 内存状态缓存
//!
//! 保存每个用户全部可变状态（设置、人格、会话、对话、token 用量、记忆）的权威副本，
//! 并记录自上次落库以来的脏标记。缓存本身从不做 I/O，持久化由
//! [`SyncEngine`](crate::sync::SyncEngine) 周期性完成。
//!
//! | 文件 | 内容 |
//! |------|------|
//! | `types.rs` | 实体类型 |
//! | `dirty.rs` | [`DirtyDelta`] 与待插入记录 |
//! | `manager.rs` | [`CacheManager`]、设置与人格、`drain` / `restore_dirty` |
//! | `session.rs` | 会话解析、会话管理、对话 |
//! | `tokens.rs` | token 用量 |
//! | `memory.rs` | 记忆 |

pub mod dirty;
mod manager;
mod memory;
mod session;
mod tokens;
pub mod types;

pub use dirty::{DirtyDelta, PendingMemory, PendingSession};
pub use manager::CacheManager;
pub use types::{
    ApiPreset, ChatMessage, Memory, MemorySource, Persona, PersonaKey, Session, Settings,
    TokenUsage,
};
