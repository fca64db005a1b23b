//! 单轮写入：把一份取出的脏标记写进一个事务
//!
//! 写入顺序：
//!
//! 1. 设置
//! 2. 级联删除人格
//! 3. 插入待落库会话，记录 临时ID → 存储ID
//! 4. 人格（指针换成存储 ID）
//! 5. 会话标题
//! 6. 删除会话
//! 7. 清空对话
//! 8. 对话增量（只插入存储中尚未有的后缀）
//! 9. token 用量
//! 10. 记忆（清空 → 删除 → 插入）
//!
//! 这里只读缓存、不改缓存：缓存侧的 ID 改写在提交成功后统一进行，
//! 回滚时缓存无需任何补偿。

use crate::cache::{CacheManager, DirtyDelta, PersonaKey};
use crate::error::Result;
use crate::store::{NewSessionRow, SettingsRow, StoreTransaction};
use std::collections::{BTreeSet, HashMap, HashSet};

/// 一轮写入的结果，提交后用于协调缓存
#[derive(Debug, Default)]
pub(crate) struct PassResult {
    /// (临时 ID, 存储 ID)，按插入顺序
    pub(crate) inserted_sessions: Vec<(i64, i64)>,
    /// 缓存中已不存在、因此没有插入的待落库会话
    pub(crate) skipped_sessions: Vec<i64>,
    /// (user_id, local_id, 存储 ID)
    pub(crate) inserted_memories: Vec<(i64, u64, i64)>,
    pub(crate) skipped_memories: usize,
    pub(crate) messages_written: usize,
}

pub(crate) fn write_delta(
    cache: &CacheManager,
    tx: &mut (dyn StoreTransaction + '_),
    delta: &DirtyDelta,
) -> Result<PassResult> {
    let mut result = PassResult::default();

    for user_id in sorted(&delta.settings) {
        if let Some(settings) = cache.peek_settings(user_id) {
            tx.upsert_settings(&SettingsRow::from_settings(user_id, &settings)?)?;
        }
    }

    for key in sorted(&delta.deleted_personas) {
        tx.delete_persona_cascade(&key)?;
    }

    let mut ids: HashMap<i64, i64> = HashMap::new();
    for pending in &delta.new_sessions {
        match cache.session(pending.provisional_id) {
            Some(session) if session.key() == pending.key() => {
                let store_id = tx.insert_session(&NewSessionRow::from(&session))?;
                ids.insert(pending.provisional_id, store_id);
                result
                    .inserted_sessions
                    .push((pending.provisional_id, store_id));
            }
            _ => result.skipped_sessions.push(pending.provisional_id),
        }
    }
    let skipped: HashSet<i64> = result.skipped_sessions.iter().copied().collect();
    let translate = |id: i64| ids.get(&id).copied().unwrap_or(id);

    // 指针指向本轮新插入会话的人格也要重写
    let mut persona_keys: BTreeSet<PersonaKey> = delta.personas.iter().cloned().collect();
    for (provisional, _) in &result.inserted_sessions {
        if let Some(key) = cache.persona_pointing_at(*provisional) {
            persona_keys.insert(key);
        }
    }
    for key in persona_keys {
        if let Some(persona) = cache.peek_persona_for_store(&key, &ids) {
            tx.upsert_persona(key.user_id, &persona)?;
        }
    }

    for id in sorted(&delta.renamed_sessions) {
        if skipped.contains(&id) {
            continue;
        }
        if let Some(session) = cache.session(id) {
            tx.update_session_title(translate(id), session.title.as_deref())?;
        }
    }

    for id in sorted(&delta.deleted_sessions) {
        if !skipped.contains(&id) {
            tx.delete_session(translate(id))?;
        }
    }

    for id in sorted(&delta.cleared_conversations) {
        if !skipped.contains(&id) {
            tx.clear_conversation(translate(id))?;
        }
    }

    for id in sorted(&delta.conversations) {
        if skipped.contains(&id) {
            continue;
        }
        let (Some(session), Some(messages)) = (cache.session(id), cache.peek_conversation(id))
        else {
            continue;
        };
        let store_id = translate(id);
        let key = session.key();
        let persisted = tx.count_messages(store_id)?;
        for message in messages.iter().skip(persisted) {
            tx.insert_message(&key, store_id, message)?;
            result.messages_written += 1;
        }
    }

    for key in sorted(&delta.tokens) {
        if let Some(usage) = cache.peek_token_usage(&key) {
            tx.upsert_token_usage(&key, &usage)?;
        }
    }

    for user_id in sorted(&delta.cleared_memories) {
        tx.delete_user_memories(user_id)?;
    }
    for memory_id in &delta.deleted_memory_ids {
        tx.delete_memory(*memory_id)?;
    }
    for pending in &delta.new_memories {
        if cache.holds_memory(pending.user_id, pending.local_id) {
            let store_id = tx.insert_memory(pending)?;
            result
                .inserted_memories
                .push((pending.user_id, pending.local_id, store_id));
        } else {
            result.skipped_memories += 1;
        }
    }

    Ok(result)
}

/// 集合按确定顺序遍历，便于复现与测试
fn sorted<T: Ord + Clone>(set: &HashSet<T>) -> Vec<T> {
    let mut items: Vec<T> = set.iter().cloned().collect();
    items.sort();
    items
}
