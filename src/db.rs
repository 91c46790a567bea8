//! Typed SQLite access for the six relational tables.
//!
//! The store owns schema migration and row-level reads used to warm the cache
//! at startup. All writes happen inside the sync cycle's transaction (see
//! `cache::sync`), so nothing here carries business logic.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user_settings (
        user_id INTEGER PRIMARY KEY,
        api_key TEXT,
        base_url TEXT,
        model TEXT,
        temperature REAL,
        token_limit INTEGER DEFAULT 0,
        current_persona TEXT DEFAULT 'default',
        enabled_tools TEXT,
        tts_voice TEXT,
        tts_style TEXT,
        tts_endpoint TEXT,
        api_presets TEXT,
        title_model TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_personas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        system_prompt TEXT NOT NULL,
        current_session_id INTEGER,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(user_id, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_personas_user_id ON user_personas(user_id)",
    "CREATE TABLE IF NOT EXISTS user_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        persona_name TEXT NOT NULL DEFAULT 'default',
        title TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user_persona ON user_sessions(user_id, persona_name)",
    "CREATE TABLE IF NOT EXISTS user_conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        persona_name TEXT NOT NULL DEFAULT 'default',
        session_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversations_session_id ON user_conversations(session_id)",
    "CREATE TABLE IF NOT EXISTS user_persona_tokens (
        user_id INTEGER NOT NULL,
        persona_name TEXT NOT NULL,
        prompt_tokens INTEGER DEFAULT 0,
        completion_tokens INTEGER DEFAULT 0,
        total_tokens INTEGER DEFAULT 0,
        PRIMARY KEY (user_id, persona_name)
    )",
    "CREATE TABLE IF NOT EXISTS user_memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT 'user',
        embedding TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_memories_user_id ON user_memories(user_id)",
];

// Columns added after the initial schema. Applied unconditionally; the
// "duplicate column" error on an up-to-date database is expected.
const ADDITIVE: &[&str] = &[
    "ALTER TABLE user_settings ADD COLUMN api_presets TEXT",
    "ALTER TABLE user_settings ADD COLUMN title_model TEXT",
    "ALTER TABLE user_personas ADD COLUMN current_session_id INTEGER",
];

#[derive(Debug, FromRow)]
pub struct SettingsRow {
    pub user_id: i64,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub token_limit: Option<i64>,
    pub current_persona: Option<String>,
    pub enabled_tools: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_style: Option<String>,
    pub tts_endpoint: Option<String>,
    pub api_presets: Option<String>,
    pub title_model: Option<String>,
}

#[derive(Debug, FromRow)]
pub struct PersonaRow {
    pub user_id: i64,
    pub name: String,
    pub system_prompt: String,
    pub current_session_id: Option<i64>,
}

#[derive(Debug, FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: i64,
    pub persona_name: String,
    pub title: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, FromRow)]
pub struct ConversationRow {
    pub session_id: i64,
    pub role: String,
    pub content: String,
}

#[derive(Debug, FromRow)]
pub struct TokenRow {
    pub user_id: i64,
    pub persona_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, FromRow)]
pub struct MemoryRow {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub source: String,
    pub embedding: Option<String>,
}

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("failed to connect to database at {url}"))?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query on
    /// the same `:memory:` instance.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema pass: create-if-missing plus tolerated additive
    /// column migrations.
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("schema creation failed")?;
        }
        for stmt in ADDITIVE {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(e).context("additive migration failed");
                }
                debug!("additive migration already applied: {stmt}");
            }
        }
        info!("database schema ready");
        Ok(())
    }

    pub async fn load_settings(&self) -> Result<Vec<SettingsRow>> {
        Ok(sqlx::query_as::<_, SettingsRow>("SELECT * FROM user_settings")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn load_personas(&self) -> Result<Vec<PersonaRow>> {
        Ok(sqlx::query_as::<_, PersonaRow>(
            "SELECT user_id, name, system_prompt, current_session_id FROM user_personas",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn load_sessions(&self) -> Result<Vec<SessionRow>> {
        Ok(sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, persona_name, title, created_at FROM user_sessions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn load_conversations(&self) -> Result<Vec<ConversationRow>> {
        Ok(sqlx::query_as::<_, ConversationRow>(
            "SELECT session_id, role, content FROM user_conversations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn load_persona_tokens(&self) -> Result<Vec<TokenRow>> {
        Ok(sqlx::query_as::<_, TokenRow>("SELECT * FROM user_persona_tokens")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn load_memories(&self) -> Result<Vec<MemoryRow>> {
        Ok(sqlx::query_as::<_, MemoryRow>(
            "SELECT id, user_id, content, source, embedding FROM user_memories ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
