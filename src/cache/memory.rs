//! 用户记忆（所有人格共享）
//!
//! 新记忆在落库前只有进程内句柄 `local_id`；同步引擎插入成功后通过
//! [`CacheManager::assign_memory_id`] 按 `(user, local_id)` 回写存储 ID。

use super::manager::CacheManager;
use super::types::{Memory, MemorySource};
use super::dirty::PendingMemory;
use tracing::debug;

impl CacheManager {
    pub fn memories(&self, user_id: i64) -> Vec<Memory> {
        self.read()
            .memories
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn memory_count(&self, user_id: i64) -> usize {
        self.read().memories.get(&user_id).map_or(0, Vec::len)
    }

    pub fn add_memory(
        &self,
        user_id: i64,
        content: &str,
        source: MemorySource,
        embedding: Option<Vec<f32>>,
    ) -> Memory {
        self.write_all(|state, book| {
            let memory = Memory {
                id: None,
                local_id: book.next_memory_local(),
                user_id,
                content: content.to_string(),
                source,
                embedding,
            };
            book.dirty.new_memories.push(PendingMemory {
                local_id: memory.local_id,
                user_id,
                content: memory.content.clone(),
                source,
                embedding: memory.embedding.clone(),
            });
            state
                .memories
                .entry(user_id)
                .or_default()
                .push(memory.clone());
            memory
        })
    }

    /// 按 0 起始下标删除；越界返回 `false`
    pub fn delete_memory(&self, user_id: i64, index: usize) -> bool {
        self.write_all(|state, book| {
            let Some(list) = state.memories.get_mut(&user_id) else {
                return false;
            };
            if index >= list.len() {
                return false;
            }
            let removed = list.remove(index);
            match removed.id {
                Some(id) => book.dirty.deleted_memory_ids.push(id),
                None => {
                    // 正在落库的记忆不在活列表里，由 assign_memory_id 负责补删
                    book.dirty.withdraw_pending_memory(removed.local_id);
                }
            }
            true
        })
    }

    /// 按 1 起始位置删除（面向用户的编号）
    pub fn delete_memory_at(&self, user_id: i64, position: usize) -> bool {
        match position.checked_sub(1) {
            Some(index) => self.delete_memory(user_id, index),
            None => false,
        }
    }

    /// 清空用户全部记忆，返回删除条数
    pub fn clear_memories(&self, user_id: i64) -> usize {
        self.write_all(|state, book| {
            let removed = state.memories.remove(&user_id).map_or(0, |m| m.len());
            book.dirty.withdraw_user_memories(user_id);
            book.dirty.cleared_memories.insert(user_id);
            removed
        })
    }

    /// 回写存储 ID；记录已被删除时登记删除该存储 ID 并返回 `false`
    pub fn assign_memory_id(&self, user_id: i64, local_id: u64, store_id: i64) -> bool {
        self.write_all(|state, book| {
            let record = state
                .memories
                .get_mut(&user_id)
                .and_then(|list| list.iter_mut().find(|m| m.local_id == local_id));
            match record {
                Some(memory) => {
                    memory.id = Some(store_id);
                    true
                }
                None => {
                    debug!(user_id, store_id, "记忆落库期间已被删除，登记补删");
                    book.dirty.deleted_memory_ids.push(store_id);
                    false
                }
            }
        })
    }

    /// 加载用：替换用户记忆，不标记脏；`local_id` 会被重新分配
    pub fn set_memories(&self, user_id: i64, memories: Vec<Memory>) {
        self.write_all(|state, book| {
            let list = memories
                .into_iter()
                .map(|mut m| {
                    m.local_id = book.next_memory_local();
                    m.user_id = user_id;
                    m
                })
                .collect();
            state.memories.insert(user_id, list);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, content: &str) -> Memory {
        Memory {
            id: Some(id),
            local_id: 0,
            user_id: 1,
            content: content.to_string(),
            source: MemorySource::User,
            embedding: None,
        }
    }

    #[test]
    fn test_delete_by_position_keeps_order() {
        let cache = CacheManager::default();
        cache.set_memories(1, vec![stored(10, "a"), stored(11, "b"), stored(12, "c")]);

        assert!(cache.delete_memory_at(1, 2));
        let contents: Vec<String> = cache.memories(1).into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["a", "c"]);
        assert_eq!(cache.drain().deleted_memory_ids, vec![11]);

        assert!(!cache.delete_memory_at(1, 0));
        assert!(!cache.delete_memory_at(1, 3));
        assert!(!cache.delete_memory(2, 0));
    }

    #[test]
    fn test_delete_pending_memory_withdraws_insert() {
        let cache = CacheManager::default();
        cache.add_memory(1, "likes tea", MemorySource::Ai, Some(vec![0.1, 0.2]));
        cache.add_memory(1, "lives in Hangzhou", MemorySource::User, None);

        assert!(cache.delete_memory(1, 0));
        let dirty = cache.drain();
        assert_eq!(dirty.new_memories.len(), 1);
        assert_eq!(dirty.new_memories[0].content, "lives in Hangzhou");
        assert!(dirty.deleted_memory_ids.is_empty());
    }

    #[test]
    fn test_clear_memories_returns_count() {
        let cache = CacheManager::default();
        cache.set_memories(1, vec![stored(1, "a"), stored(2, "b")]);
        cache.add_memory(1, "c", MemorySource::User, None);

        assert_eq!(cache.clear_memories(1), 3);
        assert_eq!(cache.memory_count(1), 0);
        let dirty = cache.drain();
        assert!(dirty.cleared_memories.contains(&1));
        assert!(dirty.new_memories.is_empty());
    }

    #[test]
    fn test_assign_memory_id() {
        let cache = CacheManager::default();
        let memory = cache.add_memory(1, "likes tea", MemorySource::User, None);
        cache.drain();

        assert!(cache.assign_memory_id(1, memory.local_id, 77));
        assert_eq!(cache.memories(1)[0].id, Some(77));

        // 删除后回写：登记补删
        let other = cache.add_memory(1, "temp", MemorySource::User, None);
        cache.drain();
        cache.delete_memory(1, 1);
        assert!(!cache.assign_memory_id(1, other.local_id, 78));
        assert_eq!(cache.drain().deleted_memory_ids, vec![78]);
    }
}
