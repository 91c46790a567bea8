//! Conversation writes. The explicit-session variants are the only ones the
//! chat pipeline uses.

use crate::cache::ChatMessage;

use super::Services;

impl Services {
    pub fn get_conversation(&self, session_id: i64) -> Vec<ChatMessage> {
        self.cache.get_conversation_by_session(session_id)
    }

    pub fn add_user_message_to_session(&self, session_id: i64, content: &str) {
        self.cache.add_message_to_session(session_id, "user", content);
    }

    pub fn add_assistant_message_to_session(&self, session_id: i64, content: &str) {
        self.cache.add_message_to_session(session_id, "assistant", content);
    }

    /// Clear the current session's history for the persona.
    pub fn clear_current_conversation(&self, user_id: i64) -> String {
        let persona_name = self.get_current_persona_name(user_id);
        let session_id = self.ensure_session(user_id, &persona_name);
        self.cache.clear_conversation_by_session(session_id);
        persona_name
    }

    pub fn pop_last_exchange(&self, session_id: i64) -> bool {
        self.cache.pop_last_exchange(session_id)
    }
}
