//! 启动加载：把存储快照灌入缓存（不产生脏标记）

use super::LoadReport;
use crate::cache::{CacheManager, ChatMessage, Memory, PersonaKey, Session};
use crate::store::StoreSnapshot;
use std::collections::BTreeMap;

pub(crate) fn apply_snapshot(cache: &CacheManager, snapshot: StoreSnapshot) -> LoadReport {
    let mut report = LoadReport {
        users: snapshot.settings.len(),
        personas: snapshot.personas.len(),
        sessions: snapshot.sessions.len(),
        messages: snapshot.messages.len(),
        token_buckets: snapshot.tokens.len(),
        memories: snapshot.memories.len(),
        max_session_id: snapshot.max_session_id,
        error: None,
    };

    for row in snapshot.settings {
        let user_id = row.user_id;
        cache.set_settings(user_id, row.into_settings(cache.defaults()));
    }

    for row in snapshot.personas {
        cache.set_persona(row.user_id, row.persona);
    }

    let mut sessions: BTreeMap<PersonaKey, Vec<Session>> = BTreeMap::new();
    for session in snapshot.sessions {
        report.max_session_id = report.max_session_id.max(session.id);
        sessions.entry(session.key()).or_default().push(session);
    }
    for (key, list) in sessions {
        cache.set_sessions(key.user_id, &key.persona, list);
    }

    let mut conversations: BTreeMap<i64, Vec<ChatMessage>> = BTreeMap::new();
    for row in snapshot.messages {
        conversations
            .entry(row.session_id)
            .or_default()
            .push(row.message);
    }
    for (session_id, messages) in conversations {
        cache.set_conversation(session_id, messages);
    }

    for row in snapshot.tokens {
        cache.set_token_usage(row.key.user_id, &row.key.persona, row.usage);
    }

    let mut memories: BTreeMap<i64, Vec<Memory>> = BTreeMap::new();
    for row in snapshot.memories {
        memories.entry(row.user_id).or_default().push(row.into_memory());
    }
    for (user_id, list) in memories {
        cache.set_memories(user_id, list);
    }

    cache.seed_session_counter(report.max_session_id);
    report
}
