//! 同步引擎
//!
//! - [`SyncEngine::load`]：启动时一次性从存储重建缓存
//! - [`SyncEngine::sync`]：取出脏标记 → 单个事务写入 → 提交后协调缓存；
//!   任何一步失败都回滚并把取出的标记原样放回，下个周期重试
//! - [`SyncEngine::spawn`]：固定周期的后台任务，停止时做最后一次同步
//!
//! ## 一轮同步的状态
//!
//! ```text
//! Idle → Draining → Writing ─┬→ Committed → Idle
//!                            └→ Failed → Restored → Idle
//! ```

mod load;
mod pass;

#[cfg(test)]
mod tests;

use crate::cache::{CacheManager, DirtyDelta};
use crate::error::Result;
use crate::store::BackingStore;
use pass::PassResult;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ── 报告类型 ─────────────────────────────────────────────────────────────────

/// 同步周期所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Draining,
    Writing,
    Committed,
    Failed,
    Restored,
}

/// 启动加载的统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub users: usize,
    pub personas: usize,
    pub sessions: usize,
    pub messages: usize,
    pub token_buckets: usize,
    pub memories: usize,
    /// 会话计数器的种子值
    pub max_session_id: i64,
    /// 加载失败时的错误信息（此时缓存为空）
    pub error: Option<String>,
}

/// 一次成功提交的统计
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// 本轮写入的脏标记摘要
    pub summary: String,
    /// (临时 ID, 存储 ID)
    pub session_ids: Vec<(i64, i64)>,
    pub skipped_sessions: usize,
    pub messages_written: usize,
    pub memories_inserted: usize,
    pub skipped_memories: usize,
    pub elapsed: Duration,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} messages, {} ms)",
            self.summary,
            self.messages_written,
            self.elapsed.as_millis()
        )
    }
}

/// 一次 `sync` 调用的结果
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// 没有脏标记，未开启事务
    Clean,
    Committed(SyncReport),
    /// 已回滚并恢复脏标记
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, SyncOutcome::Committed(_))
    }
}

// ── SyncEngine ───────────────────────────────────────────────────────────────

/// 缓存与后备存储之间的同步引擎
///
/// ```rust
/// use persona_cache::cache::CacheManager;
/// use persona_cache::store::{BackingStore, SqliteStore};
/// use persona_cache::sync::{SyncEngine, SyncOutcome};
/// use std::sync::Arc;
///
/// # fn main() -> persona_cache::error::Result<()> {
/// let store = Arc::new(SqliteStore::open_in_memory()?);
/// store.init_schema()?;
/// let cache = Arc::new(CacheManager::default());
/// let engine = SyncEngine::new(cache.clone(), store);
///
/// cache.add_message(1, "default", "user", "hello");
/// assert!(engine.sync().is_committed());
/// assert!(matches!(engine.sync(), SyncOutcome::Clean));
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    cache: Arc<CacheManager>,
    store: Arc<dyn BackingStore>,
    phase: Mutex<SyncPhase>,
    /// 同一时刻只允许一轮同步
    cycle: Mutex<()>,
}

impl SyncEngine {
    pub fn new(cache: Arc<CacheManager>, store: Arc<dyn BackingStore>) -> Self {
        Self {
            cache,
            store,
            phase: Mutex::new(SyncPhase::Idle),
            cycle: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(?phase, "同步阶段");
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// 从存储重建缓存；失败时记录日志并以空缓存继续
    pub fn load(&self) -> LoadReport {
        match self.store.load_snapshot() {
            Ok(snapshot) => {
                let report = load::apply_snapshot(&self.cache, snapshot);
                info!(
                    users = report.users,
                    personas = report.personas,
                    sessions = report.sessions,
                    messages = report.messages,
                    memories = report.memories,
                    "📥 缓存已从数据库加载"
                );
                report
            }
            Err(e) => {
                error!(error = %e, "❌ 从数据库加载失败，以空缓存启动");
                LoadReport {
                    error: Some(e.to_string()),
                    ..LoadReport::default()
                }
            }
        }
    }

    /// 执行一轮同步
    pub fn sync(&self) -> SyncOutcome {
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);

        self.set_phase(SyncPhase::Draining);
        let delta = self.cache.drain();
        if delta.is_empty() {
            self.set_phase(SyncPhase::Idle);
            return SyncOutcome::Clean;
        }

        self.set_phase(SyncPhase::Writing);
        let started = Instant::now();
        match self.write(&delta) {
            Ok(result) => {
                self.set_phase(SyncPhase::Committed);
                self.reconcile(&result);
                let report = SyncReport {
                    summary: delta.summary(),
                    session_ids: result.inserted_sessions,
                    skipped_sessions: result.skipped_sessions.len(),
                    messages_written: result.messages_written,
                    memories_inserted: result.inserted_memories.len(),
                    skipped_memories: result.skipped_memories,
                    elapsed: started.elapsed(),
                };
                info!(report = %report, "💾 已同步到数据库");
                self.set_phase(SyncPhase::Idle);
                SyncOutcome::Committed(report)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                error!(error = %e, pending = %delta.summary(), "❌ 同步失败，事务已回滚");
                self.cache.restore_dirty(delta);
                self.set_phase(SyncPhase::Restored);
                warn!("脏标记已恢复，下个周期重试");
                self.set_phase(SyncPhase::Idle);
                SyncOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn write(&self, delta: &DirtyDelta) -> Result<PassResult> {
        let mut tx = self.store.begin()?;
        match pass::write_delta(&self.cache, tx.as_mut(), delta) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "回滚失败");
                }
                Err(e)
            }
        }
    }

    /// 提交成功后把存储分配的 ID 写回缓存
    fn reconcile(&self, result: &PassResult) {
        // 先清掉被跳过会话的标记：它们的临时 ID 可能与本轮分配的存储 ID 相同
        self.cache.discard_session_markers(&result.skipped_sessions);
        self.cache.apply_session_ids(&result.inserted_sessions);
        for (user_id, local_id, store_id) in &result.inserted_memories {
            self.cache.assign_memory_id(*user_id, *local_id, *store_id);
        }
    }

    /// 启动后台同步任务
    ///
    /// 每个周期在阻塞线程池中执行一轮 [`sync`](Self::sync)；`shutdown` 被取消后
    /// 再同步最后一次然后退出。
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，跳过
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "🔄 后台同步已启动");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sync_blocking().await;
                    }
                }
            }

            info!("🛑 收到停止信号，执行最后一次同步");
            if let Some(SyncOutcome::Failed { error }) = self.sync_blocking().await {
                error!(error = %error, "最后一次同步失败，未落库的修改将丢失");
            }
        })
    }

    async fn sync_blocking(self: &Arc<Self>) -> Option<SyncOutcome> {
        let engine = Arc::clone(self);
        match tokio::task::spawn_blocking(move || engine.sync()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "同步任务异常退出");
                None
            }
        }
    }
}
