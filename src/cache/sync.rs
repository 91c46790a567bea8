//! Startup load and the periodic write-back cycle.
//!
//! One transaction per cycle. The dirty sets are swapped out atomically up
//! front; on any failure they are re-unioned with whatever accumulated during
//! the attempt so the next cycle retries. Temporary session and memory ids
//! are remapped into the live cache only after the transaction commits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::Row;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::DB_SYNC_INTERVAL;
use crate::db::Db;

use super::manager::CacheManager;
use super::types::{ApiPreset, ChatMessage, DirtySets, Memory, Persona, Session, TokenUsage, UserSettings};

/// Warm every cache map from the database image.
pub async fn load_from_database(db: &Db, cache: &CacheManager) -> Result<()> {
    let defaults = cache.defaults().clone();

    for row in db.load_settings().await? {
        let api_presets: HashMap<String, ApiPreset> = row
            .api_presets
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        cache.set_settings(
            row.user_id,
            UserSettings {
                api_key: row.api_key.unwrap_or_default(),
                base_url: row
                    .base_url
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: row.model.filter(|s| !s.is_empty()).unwrap_or_else(|| "gpt-4o".to_string()),
                temperature: row.temperature.unwrap_or(0.7),
                token_limit: row.token_limit.unwrap_or(0),
                current_persona: row
                    .current_persona
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "default".to_string()),
                enabled_tools: row
                    .enabled_tools
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| defaults.enabled_tools.clone()),
                tts_voice: row
                    .tts_voice
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| defaults.tts_voice.clone()),
                tts_style: row
                    .tts_style
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| defaults.tts_style.clone()),
                tts_endpoint: row.tts_endpoint.unwrap_or_default(),
                api_presets,
                title_model: row.title_model.unwrap_or_default(),
            },
        );
    }

    for row in db.load_personas().await? {
        cache.set_persona(
            row.user_id,
            Persona {
                name: row.name,
                system_prompt: row.system_prompt,
                current_session_id: row.current_session_id,
            },
        );
    }

    let mut max_session_id = 0i64;
    let mut sessions_by_key: HashMap<(i64, String), Vec<Session>> = HashMap::new();
    for row in db.load_sessions().await? {
        max_session_id = max_session_id.max(row.id);
        sessions_by_key
            .entry((row.user_id, row.persona_name.clone()))
            .or_default()
            .push(Session {
                id: row.id,
                user_id: row.user_id,
                persona_name: row.persona_name,
                title: row.title,
                created_at: row.created_at,
            });
    }
    for ((user_id, persona_name), sessions) in sessions_by_key {
        cache.set_sessions(user_id, &persona_name, sessions);
    }
    cache.seed_session_counter(max_session_id);

    let mut conversations: HashMap<i64, Vec<ChatMessage>> = HashMap::new();
    for row in db.load_conversations().await? {
        conversations
            .entry(row.session_id)
            .or_default()
            .push(ChatMessage { role: row.role, content: row.content });
    }
    for (session_id, messages) in conversations {
        cache.set_conversation_by_session(session_id, messages);
    }

    for row in db.load_persona_tokens().await? {
        cache.set_token_usage(
            row.user_id,
            &row.persona_name,
            TokenUsage {
                prompt_tokens: row.prompt_tokens,
                completion_tokens: row.completion_tokens,
                total_tokens: row.total_tokens,
            },
        );
    }

    let mut memories: HashMap<i64, Vec<Memory>> = HashMap::new();
    for row in db.load_memories().await? {
        let embedding = row.embedding.as_deref().and_then(|raw| serde_json::from_str(raw).ok());
        memories.entry(row.user_id).or_default().push(Memory {
            id: row.id,
            user_id: row.user_id,
            content: row.content,
            source: row.source,
            embedding,
        });
    }
    for (user_id, list) in memories {
        cache.set_memories(user_id, list);
    }

    info!("cache loaded from database");
    Ok(())
}

/// Flush all dirty state to the database in one transaction.
pub async fn sync_to_database(db: &Db, cache: &CacheManager) -> Result<()> {
    let dirty = cache.get_and_clear_dirty();
    if dirty.is_empty() {
        return Ok(());
    }

    match run_cycle(db, cache, &dirty).await {
        Ok((session_map, memory_map)) => {
            cache.apply_sync_remap(&session_map, &memory_map);
            log_summary(&dirty);
            Ok(())
        }
        Err(e) => {
            cache.restore_dirty(dirty);
            error!("sync cycle failed, dirty sets restored: {e:#}");
            Err(e)
        }
    }
}

type SessionMap = HashMap<i64, i64>;
type MemoryMap = Vec<(i64, i64, i64)>;

async fn run_cycle(db: &Db, cache: &CacheManager, dirty: &DirtySets) -> Result<(SessionMap, MemoryMap)> {
    let mut tx = db.pool().begin().await.context("failed to begin sync transaction")?;

    // Delete cascades first: personas, previously-persisted sessions, memories.
    for (user_id, persona_name) in &dirty.deleted_personas {
        sqlx::query(
            "DELETE FROM user_conversations WHERE session_id IN (
                SELECT id FROM user_sessions WHERE user_id = ? AND persona_name = ?)",
        )
        .bind(user_id)
        .bind(persona_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM user_sessions WHERE user_id = ? AND persona_name = ?")
            .bind(user_id)
            .bind(persona_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_personas WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(persona_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_persona_tokens WHERE user_id = ? AND persona_name = ?")
            .bind(user_id)
            .bind(persona_name)
            .execute(&mut *tx)
            .await?;
    }

    // A session created and deleted inside one sync window never reaches the
    // database: its pending insert and deletion cancel out here.
    let deleted_temp: HashSet<i64> = dirty.deleted_sessions.iter().copied().filter(|id| *id < 0).collect();
    let mut deleted_sessions: HashSet<i64> =
        dirty.deleted_sessions.iter().copied().filter(|id| *id >= 0).collect();

    for session_id in &deleted_sessions {
        sqlx::query("DELETE FROM user_conversations WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
    }

    for user_id in &dirty.cleared_memories {
        sqlx::query("DELETE FROM user_memories WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    for memory_id in &dirty.deleted_memory_ids {
        if *memory_id >= 0 {
            sqlx::query("DELETE FROM user_memories WHERE id = ?")
                .bind(memory_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    // Upsert settings.
    for user_id in &dirty.settings {
        let Some(s) = cache.settings_snapshot(*user_id) else { continue };
        let presets_json = if s.api_presets.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&s.api_presets)?)
        };
        sqlx::query(
            "INSERT INTO user_settings (
                user_id, api_key, base_url, model, temperature, token_limit,
                current_persona, enabled_tools, tts_voice, tts_style,
                tts_endpoint, api_presets, title_model)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id) DO UPDATE SET
                api_key = excluded.api_key,
                base_url = excluded.base_url,
                model = excluded.model,
                temperature = excluded.temperature,
                token_limit = excluded.token_limit,
                current_persona = excluded.current_persona,
                enabled_tools = excluded.enabled_tools,
                tts_voice = excluded.tts_voice,
                tts_style = excluded.tts_style,
                tts_endpoint = excluded.tts_endpoint,
                api_presets = excluded.api_presets,
                title_model = excluded.title_model",
        )
        .bind(user_id)
        .bind(&s.api_key)
        .bind(&s.base_url)
        .bind(&s.model)
        .bind(s.temperature)
        .bind(s.token_limit)
        .bind(&s.current_persona)
        .bind(&s.enabled_tools)
        .bind(&s.tts_voice)
        .bind(&s.tts_style)
        .bind(&s.tts_endpoint)
        .bind(presets_json)
        .bind(&s.title_model)
        .execute(&mut *tx)
        .await?;
    }

    // Upsert personas. A pointer at a still-temporary session is stored as
    // NULL and fixed up right after the session insert below.
    let mut pending_pointers: Vec<(i64, String, i64)> = Vec::new();
    for (user_id, persona_name) in &dirty.personas {
        let Some(p) = cache.persona_snapshot(*user_id, persona_name) else { continue };
        let current = match p.current_session_id {
            Some(id) if id < 0 => {
                pending_pointers.push((*user_id, persona_name.clone(), id));
                None
            }
            other => other,
        };
        sqlx::query(
            "INSERT INTO user_personas (user_id, name, system_prompt, current_session_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, name) DO UPDATE SET
                system_prompt = excluded.system_prompt,
                current_session_id = excluded.current_session_id",
        )
        .bind(user_id)
        .bind(persona_name)
        .bind(&p.system_prompt)
        .bind(current)
        .execute(&mut *tx)
        .await?;
    }

    // Insert new sessions and capture database ids.
    let mut session_map: SessionMap = HashMap::new();
    for session in &dirty.new_sessions {
        if deleted_temp.contains(&session.id) {
            continue;
        }
        let result = sqlx::query(
            "INSERT INTO user_sessions (user_id, persona_name, title) VALUES (?, ?, ?)",
        )
        .bind(session.user_id)
        .bind(&session.persona_name)
        .bind(&session.title)
        .execute(&mut *tx)
        .await?;
        session_map.insert(session.id, result.last_insert_rowid());
    }

    // Remap the local working sets before any statement that consults them.
    let remap = |id: i64| -> i64 { *session_map.get(&id).unwrap_or(&id) };
    deleted_sessions = dirty
        .deleted_sessions
        .iter()
        .map(|id| remap(*id))
        .filter(|id| *id >= 0)
        .collect();
    let session_titles: HashMap<i64, String> = dirty
        .dirty_session_titles
        .iter()
        .filter(|(id, _)| !deleted_temp.contains(*id))
        .map(|(id, title)| (remap(*id), title.clone()))
        .collect();
    let cleared_conversations: HashSet<i64> = dirty
        .cleared_conversations
        .iter()
        .filter(|id| !deleted_temp.contains(*id))
        .map(|id| remap(*id))
        .collect();

    for (user_id, persona_name, temp_id) in &pending_pointers {
        if let Some(db_id) = session_map.get(temp_id) {
            sqlx::query("UPDATE user_personas SET current_session_id = ? WHERE user_id = ? AND name = ?")
                .bind(db_id)
                .bind(user_id)
                .bind(persona_name)
                .execute(&mut *tx)
                .await?;
        }
    }

    for (session_id, title) in &session_titles {
        sqlx::query("UPDATE user_sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
    }

    for session_id in &deleted_sessions {
        sqlx::query("DELETE FROM user_conversations WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
    }

    for session_id in &cleared_conversations {
        sqlx::query("DELETE FROM user_conversations WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
    }

    // Insert new memories and capture database ids.
    let mut memory_map: MemoryMap = Vec::new();
    for memory in &dirty.new_memories {
        let embedding_json = memory
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO user_memories (user_id, content, source, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(memory.user_id)
        .bind(&memory.content)
        .bind(&memory.source)
        .bind(embedding_json)
        .execute(&mut *tx)
        .await?;
        memory_map.push((memory.user_id, memory.id, result.last_insert_rowid()));
    }

    // Append conversation rows the database does not have yet. The cache
    // length vs. row count comparison keeps every message inserted at most
    // once even across failed cycles.
    for session_id in &dirty.conversations {
        if deleted_temp.contains(session_id) {
            continue;
        }
        let db_session_id = remap(*session_id);
        if deleted_sessions.contains(&db_session_id) {
            continue;
        }
        let Some(session) = cache.get_session_by_id(*session_id) else { continue };
        let row = sqlx::query("SELECT COUNT(*) AS n FROM user_conversations WHERE session_id = ?")
            .bind(db_session_id)
            .fetch_one(&mut *tx)
            .await?;
        let db_count: i64 = row.get("n");
        let messages = cache.get_conversation_by_session(*session_id);
        for message in messages.iter().skip(db_count.max(0) as usize) {
            sqlx::query(
                "INSERT INTO user_conversations (user_id, persona_name, session_id, role, content)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session.user_id)
            .bind(&session.persona_name)
            .bind(db_session_id)
            .bind(&message.role)
            .bind(&message.content)
            .execute(&mut *tx)
            .await?;
        }
    }

    // Upsert per-persona token counters.
    for (user_id, persona_name) in &dirty.tokens {
        let Some(t) = cache.token_snapshot(*user_id, persona_name) else { continue };
        sqlx::query(
            "INSERT INTO user_persona_tokens
                (user_id, persona_name, prompt_tokens, completion_tokens, total_tokens)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (user_id, persona_name) DO UPDATE SET
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                total_tokens = excluded.total_tokens",
        )
        .bind(user_id)
        .bind(persona_name)
        .bind(t.prompt_tokens)
        .bind(t.completion_tokens)
        .bind(t.total_tokens)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await.context("failed to commit sync transaction")?;
    Ok((session_map, memory_map))
}

fn log_summary(dirty: &DirtySets) {
    let mut parts = Vec::new();
    let mut push = |count: usize, label: &str| {
        if count > 0 {
            parts.push(format!("{count} {label}"));
        }
    };
    push(dirty.settings.len(), "settings");
    push(dirty.personas.len(), "personas");
    push(dirty.deleted_personas.len(), "deleted personas");
    push(dirty.new_sessions.len(), "new sessions");
    push(dirty.dirty_session_titles.len(), "session titles");
    push(dirty.deleted_sessions.len(), "deleted sessions");
    push(dirty.conversations.len(), "conversations");
    push(dirty.cleared_conversations.len(), "cleared conversations");
    push(dirty.tokens.len(), "token records");
    push(dirty.new_memories.len(), "new memories");
    push(dirty.deleted_memory_ids.len(), "deleted memories");
    push(dirty.cleared_memories.len(), "cleared memories");
    if !parts.is_empty() {
        info!("synced to database: {}", parts.join(", "));
    }
}

/// Background worker: one sync cycle every [`DB_SYNC_INTERVAL`]. Never runs
/// concurrently with itself.
pub fn spawn_sync_loop(db: Arc<Db>, cache: Arc<CacheManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DB_SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = sync_to_database(&db, &cache).await {
                warn!("periodic sync failed: {e:#}");
            }
        }
    })
}
