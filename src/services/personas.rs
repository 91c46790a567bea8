//! Persona operations.

use crate::cache::Persona;
use crate::error::BotError;

use super::Services;

impl Services {
    pub fn get_personas(&self, user_id: i64) -> Vec<Persona> {
        self.cache.get_personas(user_id)
    }

    pub fn get_current_persona(&self, user_id: i64) -> Persona {
        self.cache.get_current_persona(user_id)
    }

    pub fn get_current_persona_name(&self, user_id: i64) -> String {
        self.cache.get_current_persona_name(user_id)
    }

    pub fn get_system_prompt(&self, user_id: i64) -> String {
        self.cache.get_current_persona(user_id).system_prompt
    }

    pub fn persona_exists(&self, user_id: i64, name: &str) -> bool {
        self.cache.get_persona(user_id, name).is_some()
    }

    /// Switch to a persona, creating it with the default prompt if missing.
    /// Returns true when the persona already existed.
    pub fn switch_persona(&self, user_id: i64, name: &str) -> bool {
        let existed = self.persona_exists(user_id, name);
        if !existed {
            self.cache.create_persona(user_id, name, &self.default_system_prompt);
        }
        self.cache.set_current_persona(user_id, name);
        existed
    }

    /// Returns false when the name is already taken.
    pub fn create_persona(&self, user_id: i64, name: &str, system_prompt: Option<&str>) -> bool {
        let prompt = system_prompt.unwrap_or(&self.default_system_prompt);
        self.cache.create_persona(user_id, name, prompt)
    }

    pub fn delete_persona(&self, user_id: i64, name: &str) -> Result<(), BotError> {
        if name == "default" {
            return Err(BotError::Precondition("Cannot delete the default persona.".to_string()));
        }
        if self.cache.delete_persona(user_id, name) {
            Ok(())
        } else {
            Err(BotError::Precondition(format!("Persona '{name}' not found.")))
        }
    }

    pub fn update_persona_prompt(&self, user_id: i64, name: &str, prompt: &str) -> bool {
        self.cache.update_persona_prompt(user_id, name, prompt)
    }

    pub fn update_current_prompt(&self, user_id: i64, prompt: &str) -> bool {
        let name = self.get_current_persona_name(user_id);
        self.cache.update_persona_prompt(user_id, &name, prompt)
    }
}
