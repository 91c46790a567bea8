//! Markdown export of the current session.

use chrono::Local;

use super::Services;

impl Services {
    /// Render the current session as a Markdown document. Returns the file
    /// name and content, or `None` when the session has no messages.
    pub fn export_session_markdown(&self, user_id: i64) -> Option<(String, String)> {
        let persona_name = self.get_current_persona_name(user_id);
        let session_id = self.ensure_session(user_id, &persona_name);
        let conversation = self.get_conversation(session_id);
        if conversation.is_empty() {
            return None;
        }

        let now = Local::now();
        let mut content = String::from("# AI Chat Export\n");
        content.push_str(&format!("- Date: {}\n", now.format("%Y-%m-%d %H:%M:%S")));
        content.push_str(&format!("- Persona: {persona_name}\n"));
        content.push_str(&format!("- Session ID: {session_id}\n"));
        content.push_str(&format!("- Messages: {}\n\n---\n\n", conversation.len()));

        for message in &conversation {
            let role = if message.role == "user" { "User" } else { "Assistant" };
            content.push_str(&format!("**{role}:**\n{}\n\n---\n\n", message.content));
        }

        let filename = format!("chat_{persona_name}_{}.md", now.format("%Y%m%d_%H%M%S"));
        Some((filename, content))
    }
}
