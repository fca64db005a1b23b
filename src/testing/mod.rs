//! 测试基础设施
//!
//! 提供在不打开真实数据库的情况下测试同步引擎的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockStore`] | 替代 SQLite，内存表 + 真实的提交 / 回滚语义 |
//! | [`StoreOp`] | 存储操作名，用于故障注入与调用计数 |
//!
//! # 设计原则
//!
//! - **零 I/O**：所有数据都在内存中
//! - **可脚本化**：通过 `fail_next()` 让指定操作失败一次，`with_session_ids_from()` 控制 ID 分配
//! - **可观测**：通过 `calls()` / `call_count()` 以及 `session_ids()` / `messages()` 等方法检查结果
//! - **线程安全**：内部使用 `Arc<Mutex<_>>`，可在后台同步任务的测试中共享
//!
//! # 使用示例
//!
//! ## 测试失败回滚
//!
//! ```rust
//! use persona_cache::cache::CacheManager;
//! use persona_cache::sync::{SyncEngine, SyncOutcome};
//! use persona_cache::testing::{MockStore, StoreOp};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MockStore::new());
//! let cache = Arc::new(CacheManager::default());
//! let engine = SyncEngine::new(cache.clone(), store.clone());
//!
//! cache.set_token_limit(7, 2000);
//! let before = cache.dirty_snapshot();
//!
//! store.fail_next(StoreOp::UpsertPersona);
//! assert!(matches!(engine.sync(), SyncOutcome::Failed { .. }));
//! assert_eq!(cache.dirty_snapshot(), before);  // 标记全部恢复
//! assert!(store.settings(7).is_none());        // 事务已回滚
//! ```

mod mock_store;

pub use mock_store::{MockStore, StoreOp};
