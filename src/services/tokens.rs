//! Token accounting. The limit is global per user; counters are per persona.

use crate::cache::TokenUsage;

use super::Services;

impl Services {
    pub fn get_token_usage(&self, user_id: i64, persona_name: &str) -> TokenUsage {
        self.cache.get_token_usage(user_id, persona_name)
    }

    pub fn add_token_usage(&self, user_id: i64, persona_name: &str, prompt: i64, completion: i64) {
        self.cache.add_token_usage(user_id, persona_name, prompt, completion);
    }

    pub fn reset_token_usage(&self, user_id: i64, persona_name: &str) {
        self.cache.reset_token_usage(user_id, persona_name);
    }

    pub fn get_total_tokens(&self, user_id: i64) -> i64 {
        self.cache.total_tokens_all_personas(user_id)
    }

    /// `None` means no limit is set.
    pub fn get_remaining_tokens(&self, user_id: i64) -> Option<i64> {
        let limit = self.cache.get_token_limit(user_id);
        if limit == 0 {
            return None;
        }
        Some((limit - self.get_total_tokens(user_id)).max(0))
    }

    pub fn get_usage_percentage(&self, user_id: i64) -> Option<f64> {
        let limit = self.cache.get_token_limit(user_id);
        if limit == 0 {
            return None;
        }
        let total = self.get_total_tokens(user_id) as f64;
        Some((total / limit as f64 * 100.0).min(100.0))
    }
}
