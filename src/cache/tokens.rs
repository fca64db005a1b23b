//! Token 用量统计
//!
//! 用量按 `(user, persona)` 分桶累计，全局上限在 [`Settings::token_limit`](super::Settings)
//! 上，0 表示不限制。

use super::manager::CacheManager;
use super::types::{PersonaKey, TokenUsage};

impl CacheManager {
    pub fn token_usage(&self, user_id: i64, persona: &str) -> TokenUsage {
        let key = PersonaKey::new(user_id, persona);
        self.read().token_ref(&key).copied().unwrap_or_default()
    }

    /// 累加一次调用的用量
    pub fn add_token_usage(
        &self,
        user_id: i64,
        persona: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| {
            state
                .token_entry(&key)
                .add(prompt_tokens, completion_tokens);
            book.dirty.tokens.insert(key);
        });
    }

    pub fn reset_token_usage(&self, user_id: i64, persona: &str) {
        let key = PersonaKey::new(user_id, persona);
        self.write_user(user_id, |state, book| {
            *state.token_entry(&key) = TokenUsage::default();
            book.dirty.tokens.insert(key);
        });
    }

    /// 用户所有人格的 total_tokens 之和（饱和）
    pub fn total_tokens_all_personas(&self, user_id: i64) -> u64 {
        self.read().tokens.get(&user_id).map_or(0, |buckets| {
            buckets
                .values()
                .map(|usage| usage.total_tokens)
                .fold(0, u64::saturating_add)
        })
    }

    /// 剩余额度；未设上限时返回 `None`
    pub fn remaining_tokens(&self, user_id: i64) -> Option<u64> {
        let limit = self.token_limit(user_id);
        if limit == 0 {
            return None;
        }
        Some(limit.saturating_sub(self.total_tokens_all_personas(user_id)))
    }

    /// 已用百分比（封顶 100）；未设上限时返回 `None`
    pub fn usage_percentage(&self, user_id: i64) -> Option<f64> {
        let limit = self.token_limit(user_id);
        if limit == 0 {
            return None;
        }
        let used = self.total_tokens_all_personas(user_id) as f64;
        Some((used / limit as f64 * 100.0).min(100.0))
    }

    /// 加载用：写入用量，不标记脏
    pub fn set_token_usage(&self, user_id: i64, persona: &str, usage: TokenUsage) {
        *self.write().token_entry(&PersonaKey::new(user_id, persona)) = usage;
    }
}
