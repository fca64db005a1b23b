use super::*;
use crate::cache::{ChatMessage, MemorySource, PersonaKey};
use crate::store::SqliteStore;
use crate::testing::{MockStore, StoreOp};

fn engine_with(store: Arc<MockStore>) -> (Arc<CacheManager>, SyncEngine) {
    let cache = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(cache.clone(), store);
    (cache, engine)
}

fn committed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Committed(report) => report,
        other => panic!("期望提交成功，实际为 {other:?}"),
    }
}

fn sqlite_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init_schema().unwrap();
    Arc::new(store)
}

// ── 基本周期 ─────────────────────────────────────────────────────────────────

#[test]
fn test_clean_cache_opens_no_transaction() {
    let store = Arc::new(MockStore::new());
    let (_cache, engine) = engine_with(store.clone());

    assert!(matches!(engine.sync(), SyncOutcome::Clean));
    assert_eq!(store.call_count(StoreOp::Begin), 0);
    assert_eq!(engine.phase(), SyncPhase::Idle);
}

#[test]
fn test_provisional_session_rekeyed_to_store_id() {
    let store = Arc::new(MockStore::new().with_session_ids_from(41));
    let (cache, engine) = engine_with(store.clone());

    let provisional = cache.add_message(1, "default", "user", "hi");
    assert_eq!(provisional, 1);

    let report = committed(engine.sync());
    assert_eq!(report.session_ids, vec![(1, 42)]);
    assert_eq!(report.messages_written, 1);

    // 缓存中所有引用都换成了存储 ID
    assert!(cache.session(1).is_none());
    assert_eq!(cache.current_session_id(1, "default"), Some(42));
    assert_eq!(cache.conversation(42), vec![ChatMessage::user("hi")]);
    assert!(!cache.is_dirty());

    // 存储中人格指针写的是存储 ID
    assert_eq!(store.session_ids(), vec![42]);
    assert_eq!(store.messages(42), vec![ChatMessage::user("hi")]);
    let persona = store.persona(1, "default").unwrap();
    assert_eq!(persona.current_session_id, Some(42));
    assert_eq!(store.settings(1).unwrap().current_persona.as_deref(), Some("default"));
}

#[test]
fn test_messages_after_rekey_land_on_store_id() {
    let store = Arc::new(MockStore::new().with_session_ids_from(41));
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "one");
    committed(engine.sync());

    assert_eq!(cache.add_message(1, "default", "assistant", "two"), 42);
    let report = committed(engine.sync());
    assert!(report.session_ids.is_empty());
    assert_eq!(report.messages_written, 1);
    assert_eq!(store.messages(42).len(), 2);
}

#[test]
fn test_conversation_suffix_is_idempotent() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "q");
    cache.add_message(1, "default", "assistant", "a");
    committed(engine.sync());

    // 没有新消息时重复标记也不会重复插入
    let id = cache.current_session_id(1, "default").unwrap();
    cache.restore_dirty(DirtyDelta {
        conversations: [id].into_iter().collect(),
        ..DirtyDelta::default()
    });
    let report = committed(engine.sync());
    assert_eq!(report.messages_written, 0);
    assert_eq!(store.messages(id).len(), 2);
    assert_eq!(store.call_count(StoreOp::InsertMessage), 2);
}

#[test]
fn test_cleared_conversation_then_new_message() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "old 1");
    cache.add_message(1, "default", "assistant", "old 2");
    committed(engine.sync());
    let id = cache.current_session_id(1, "default").unwrap();

    assert!(cache.clear_conversation(id));
    cache.add_message(1, "default", "user", "fresh");
    committed(engine.sync());

    assert_eq!(store.messages(id), vec![ChatMessage::user("fresh")]);
}

// ── 失败与重试 ───────────────────────────────────────────────────────────────

#[test]
fn test_failure_rolls_back_and_restores_every_marker() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "hi");
    cache.add_token_usage(1, "default", 10, 5);
    cache.add_memory(1, "likes tea", MemorySource::User, None);
    let before = cache.dirty_snapshot();

    // 设置已写入之后才失败
    store.fail_next(StoreOp::InsertSession);
    let outcome = engine.sync();
    assert!(matches!(outcome, SyncOutcome::Failed { .. }));
    assert_eq!(engine.phase(), SyncPhase::Idle);

    assert_eq!(store.call_count(StoreOp::UpsertSettings), 1);
    assert_eq!(store.call_count(StoreOp::Rollback), 1);
    assert_eq!(store.call_count(StoreOp::Commit), 0);
    assert!(store.settings(1).is_none(), "回滚后不应有任何行");
    assert!(store.session_ids().is_empty());

    // 缓存原样保留，标记与失败前完全一致
    assert_eq!(cache.dirty_snapshot(), before);
    assert_eq!(cache.current_session_id(1, "default"), Some(1));
    assert!(cache.memories(1)[0].id.is_none());
}

#[test]
fn test_retry_after_failure_includes_later_edits() {
    let store = Arc::new(MockStore::new().with_session_ids_from(99));
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "first");
    store.fail_next(StoreOp::Commit);
    assert!(!engine.sync().is_committed());

    cache.add_message(1, "default", "assistant", "second");
    let report = committed(engine.sync());

    assert_eq!(report.session_ids, vec![(1, 100)]);
    assert_eq!(
        store.messages(100),
        vec![ChatMessage::user("first"), ChatMessage::assistant("second")]
    );
    assert!(!cache.is_dirty());
}

#[test]
fn test_begin_failure_keeps_markers() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.set_token_limit(1, 1000);
    store.fail_next(StoreOp::Begin);
    assert!(!engine.sync().is_committed());
    assert!(cache.is_dirty());

    committed(engine.sync());
    assert_eq!(store.settings(1).unwrap().token_limit, Some(1000));
}

// ── 会话与人格 ───────────────────────────────────────────────────────────────

#[test]
fn test_session_deleted_mid_cycle_is_skipped() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "doomed");

    // 模拟同步过程中会话被删除：标记已被取走，随后删除，再放回
    let delta = cache.drain();
    assert!(cache.delete_session(1, "default", 1));
    let replacement = cache.current_session_id(1, "default").unwrap();
    assert_eq!(replacement, 2);
    cache.restore_dirty(delta);

    let report = committed(engine.sync());
    assert_eq!(report.skipped_sessions, 1);
    // 替补会话拿到存储 ID 1，与被跳过的临时 ID 相同
    assert_eq!(report.session_ids, vec![(2, 1)]);
    assert_eq!(store.call_count(StoreOp::DeleteSession), 0);
    assert!(store.messages(1).is_empty());

    assert_eq!(cache.current_session_id(1, "default"), Some(1));
    assert_eq!(store.persona(1, "default").unwrap().current_session_id, Some(1));
    assert!(!cache.is_dirty());
}

#[test]
fn test_rename_pending_session_inserts_latest_title() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    let session = cache.create_session(1, "default", Some("draft"));
    assert!(cache.rename_session(session.id, "final"));
    committed(engine.sync());

    assert_eq!(store.call_count(StoreOp::UpdateSessionTitle), 0);
    let stored = store.session(cache.current_session_id(1, "default").unwrap());
    assert_eq!(stored.unwrap().title.as_deref(), Some("final"));
}

#[test]
fn test_rename_persisted_session() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.ensure_current_session(1, "default");
    committed(engine.sync());
    let id = cache.current_session_id(1, "default").unwrap();

    assert!(cache.rename_current_session(1, "default", "Trip plans"));
    committed(engine.sync());
    assert_eq!(store.call_count(StoreOp::UpdateSessionTitle), 1);
    assert_eq!(store.session(id).unwrap().title.as_deref(), Some("Trip plans"));
}

#[test]
fn test_delete_persisted_session() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_message(1, "default", "user", "hi");
    cache.create_session(1, "default", Some("second"));
    committed(engine.sync());
    assert_eq!(store.session_ids(), vec![1, 2]);

    assert!(cache.delete_session(1, "default", 1));
    committed(engine.sync());
    assert_eq!(store.session_ids(), vec![2]);
    assert!(store.messages(1).is_empty());
}

#[test]
fn test_persona_delete_cascades_in_store() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.create_persona(1, "coder", "You write Rust.");
    cache.switch_persona(1, "coder");
    cache.add_message(1, "coder", "user", "borrowck?");
    cache.add_token_usage(1, "coder", 3, 4);
    committed(engine.sync());
    assert!(store.persona(1, "coder").is_some());

    assert!(cache.delete_persona(1, "coder"));
    committed(engine.sync());

    let key = PersonaKey::new(1, "coder");
    assert!(store.persona(1, "coder").is_none());
    assert!(store.session_ids().is_empty());
    assert!(store.token_usage(&key).is_none());
    assert_eq!(store.settings(1).unwrap().current_persona.as_deref(), Some("default"));
}

#[test]
fn test_pointer_to_still_pending_session_is_stored_as_null() {
    let store = Arc::new(MockStore::new());
    let (cache, _engine) = engine_with(store.clone());

    cache.create_session(1, "default", None);
    let delta = cache.drain();
    // 会话的插入仍在途中，只写人格
    cache.restore_dirty(DirtyDelta {
        new_sessions: delta.new_sessions.clone(),
        ..DirtyDelta::default()
    });
    let only_persona = DirtyDelta {
        personas: delta.personas.clone(),
        ..DirtyDelta::default()
    };

    let mut tx = store.begin().unwrap();
    pass::write_delta(&cache, tx.as_mut(), &only_persona).unwrap();
    tx.commit().unwrap();

    assert_eq!(store.persona(1, "default").unwrap().current_session_id, None);
}

// ── Token 与记忆 ─────────────────────────────────────────────────────────────

#[test]
fn test_token_usage_upserted() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_token_usage(1, "default", 100, 50);
    committed(engine.sync());
    cache.add_token_usage(1, "default", 1, 1);
    committed(engine.sync());

    let usage = store.token_usage(&PersonaKey::new(1, "default")).unwrap();
    assert_eq!(usage.total_tokens, 152);
    assert_eq!(store.call_count(StoreOp::UpsertTokenUsage), 2);
}

#[test]
fn test_memory_id_written_back_then_deleted() {
    let store = Arc::new(MockStore::new().with_memory_ids_from(9));
    let (cache, engine) = engine_with(store.clone());

    cache.add_memory(1, "likes tea", MemorySource::Ai, Some(vec![0.5, 0.25]));
    let report = committed(engine.sync());
    assert_eq!(report.memories_inserted, 1);

    let memory = &cache.memories(1)[0];
    assert_eq!(memory.id, Some(10));
    assert_eq!(store.memories()[0].embedding.as_deref(), Some("[0.5,0.25]"));

    assert!(cache.delete_memory_at(1, 1));
    committed(engine.sync());
    assert!(store.memories().is_empty());
}

#[test]
fn test_memory_deleted_mid_cycle_is_cleaned_up() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_memory(1, "a", MemorySource::User, None);
    cache.add_memory(1, "b", MemorySource::User, None);
    let delta = cache.drain();
    // 第一条在落库过程中被删：插入被跳过
    assert!(cache.delete_memory(1, 0));
    cache.restore_dirty(delta);

    let report = committed(engine.sync());
    assert_eq!(report.memories_inserted, 1);
    assert_eq!(report.skipped_memories, 1);
    let stored: Vec<String> = store.memories().into_iter().map(|m| m.content).collect();
    assert_eq!(stored, vec!["b".to_string()]);
}

#[test]
fn test_clear_memories_then_add() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    cache.add_memory(1, "old", MemorySource::User, None);
    cache.add_memory(2, "other user", MemorySource::User, None);
    committed(engine.sync());

    assert_eq!(cache.clear_memories(1), 1);
    cache.add_memory(1, "new", MemorySource::User, None);
    committed(engine.sync());

    let mut stored: Vec<String> = store.memories().into_iter().map(|m| m.content).collect();
    stored.sort();
    assert_eq!(stored, vec!["new".to_string(), "other user".to_string()]);
}

// ── 加载 ─────────────────────────────────────────────────────────────────────

#[test]
fn test_load_failure_starts_empty() {
    let store = Arc::new(MockStore::new());
    let (cache, engine) = engine_with(store.clone());

    store.fail_next(StoreOp::LoadSnapshot);
    let report = engine.load();
    assert!(report.error.is_some());
    assert_eq!(report.users, 0);
    assert!(!cache.is_dirty());
}

#[test]
fn test_sqlite_round_trip_through_load() {
    let store = sqlite_store();

    let writer = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(writer.clone(), store.clone());
    writer.set_token_limit(1, 5000);
    writer.create_persona(1, "coder", "You write Rust.");
    writer.switch_persona(1, "coder");
    writer.add_message(1, "coder", "user", "hi");
    writer.add_message(1, "coder", "assistant", "hello");
    writer.add_token_usage(1, "coder", 10, 20);
    writer.add_memory(1, "likes tea", MemorySource::User, Some(vec![0.5, 0.25]));
    committed(engine.sync());
    let session_id = writer.current_session_id(1, "coder").unwrap();

    let reader = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(reader.clone(), store);
    let report = engine.load();

    assert!(report.error.is_none());
    assert_eq!(report.users, 1);
    assert_eq!(report.personas, 2);
    assert_eq!(report.sessions, 1);
    assert_eq!(report.messages, 2);
    assert_eq!(report.memories, 1);
    assert!(!reader.is_dirty(), "加载不应产生脏标记");

    assert_eq!(reader.token_limit(1), 5000);
    assert_eq!(reader.current_persona_name(1), "coder");
    assert_eq!(reader.current_persona(1).system_prompt, "You write Rust.");
    assert_eq!(reader.current_session_id(1, "coder"), Some(session_id));
    assert_eq!(
        reader.current_conversation(1, "coder"),
        vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]
    );
    assert_eq!(reader.token_usage(1, "coder").total_tokens, 30);

    let memories = reader.memories(1);
    assert!(memories[0].id.is_some());
    assert_eq!(memories[0].embedding, Some(vec![0.5, 0.25]));
    assert!(!reader.is_dirty());
}

#[test]
fn test_counter_seeded_past_deleted_store_ids() {
    let store = sqlite_store();

    let writer = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(writer.clone(), store.clone());
    writer.create_session(1, "default", None);
    writer.create_session(1, "default", None);
    writer.create_session(1, "default", None);
    committed(engine.sync());
    assert!(writer.delete_session(1, "default", 3));
    committed(engine.sync());

    let reader = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(reader.clone(), store);
    assert_eq!(engine.load().max_session_id, 3);

    // 存储不会复用 3，临时 ID 也从 4 开始，落库后无需改写
    let session = reader.create_session(1, "default", None);
    assert_eq!(session.id, 4);
    let report = committed(engine.sync());
    assert_eq!(report.session_ids, vec![(4, 4)]);
    assert_eq!(reader.current_session_id(1, "default"), Some(4));
}

#[test]
fn test_next_provisional_id_skips_deleted_latest_session() {
    let store = sqlite_store();

    let writer = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(writer.clone(), store.clone());
    writer.create_session(1, "default", None);
    writer.create_session(1, "default", None);
    assert_eq!(committed(engine.sync()).session_ids, vec![(1, 1), (2, 2)]);
    assert!(writer.delete_session(1, "default", 2));
    committed(engine.sync());

    let reader = Arc::new(CacheManager::default());
    let engine = SyncEngine::new(reader.clone(), store);
    let report = engine.load();
    assert_eq!(report.sessions, 1);
    assert_eq!(report.max_session_id, 2);

    let session = reader.create_session(1, "default", None);
    assert_eq!(session.id, 3);
    assert_eq!(committed(engine.sync()).session_ids, vec![(3, 3)]);
}

// ── 后台任务 ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_spawned_loop_flushes_on_shutdown() {
    let store = Arc::new(MockStore::new());
    let cache = Arc::new(CacheManager::default());
    let engine = Arc::new(SyncEngine::new(cache.clone(), store.clone()));

    let shutdown = CancellationToken::new();
    let handle = engine
        .clone()
        .spawn(Duration::from_secs(3600), shutdown.clone());

    cache.add_message(1, "default", "user", "bye");
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(store.session_ids(), vec![1]);
    assert_eq!(store.messages(1), vec![ChatMessage::user("bye")]);
    assert!(!cache.is_dirty());
    assert_eq!(engine.phase(), SyncPhase::Idle);
}
