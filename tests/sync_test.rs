//! Write-back cycle: persistence, temp-id remapping, retry on failure.

mod helpers;

use gemen::cache::sync::sync_to_database;
use helpers::test_env;

#[tokio::test]
async fn settings_and_default_persona_persist() {
    let (db, cache, services) = test_env().await;
    services.set_model(1, "gpt-4.1-mini");

    sync_to_database(&db, &cache).await.unwrap();

    let settings = db.load_settings().await.unwrap();
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].user_id, 1);
    assert_eq!(settings[0].model.as_deref(), Some("gpt-4.1-mini"));

    let personas = db.load_personas().await.unwrap();
    assert_eq!(personas.len(), 1);
    assert_eq!(personas[0].name, "default");
}

#[tokio::test]
async fn conversation_rows_are_inserted_exactly_once() {
    let (db, cache, services) = test_env().await;
    let persona = services.get_current_persona_name(1);
    let session_id = services.ensure_session(1, &persona);

    services.add_user_message_to_session(session_id, "hello");
    services.add_assistant_message_to_session(session_id, "hi there");
    sync_to_database(&db, &cache).await.unwrap();

    services.add_user_message_to_session(session_id, "how are you?");
    sync_to_database(&db, &cache).await.unwrap();
    // A cycle with nothing new must not duplicate rows.
    sync_to_database(&db, &cache).await.unwrap();

    let rows = db.load_conversations().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].content, "hello");
    assert_eq!(rows[1].content, "hi there");
    assert_eq!(rows[2].content, "how are you?");

    // Persisted rows equal the cached list after a sync.
    let db_session_id = rows[0].session_id;
    let cached = cache.get_conversation_by_session(db_session_id);
    assert_eq!(cached.len(), rows.len());
}

#[tokio::test]
async fn temporary_session_ids_are_remapped_everywhere() {
    let (db, cache, services) = test_env().await;
    let persona = services.get_current_persona_name(7);
    let temp_id = services.ensure_session(7, &persona);
    assert!(temp_id < 0);
    services.add_user_message_to_session(temp_id, "first");

    sync_to_database(&db, &cache).await.unwrap();

    let sessions = cache.get_sessions(7, &persona);
    assert_eq!(sessions.len(), 1);
    let db_id = sessions[0].id;
    assert!(db_id > 0);

    // Conversations moved under the database id, and the persona pointer
    // followed.
    assert_eq!(cache.get_conversation_by_session(db_id).len(), 1);
    assert_eq!(cache.get_current_session_id(7, &persona), Some(db_id));

    // No dirty set still references the temporary id.
    let dirty = cache.get_and_clear_dirty();
    assert!(dirty.is_empty(), "expected clean dirty sets after sync");

    let rows = db.load_conversations().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].session_id, db_id);
}

#[tokio::test]
async fn create_rename_delete_within_one_window_leaves_nothing() {
    let (db, cache, _services) = test_env().await;
    cache.get_settings(3);
    let session = cache.create_session(3, "default", Some("A".into()));
    cache.add_message_to_session(session.id, "user", "hi");
    cache.update_session_title(session.id, "A'");
    cache.delete_session(3, "default", session.id);

    sync_to_database(&db, &cache).await.unwrap();

    assert!(db.load_sessions().await.unwrap().is_empty());
    assert!(db.load_conversations().await.unwrap().is_empty());
    assert!(cache.get_and_clear_dirty().is_empty());
}

#[tokio::test]
async fn failed_cycle_restores_dirty_sets_for_retry() {
    let (db, cache, services) = test_env().await;
    services.set_model(9, "gpt-4o-mini");

    sqlx::query("DROP TABLE user_settings").execute(db.pool()).await.unwrap();
    assert!(sync_to_database(&db, &cache).await.is_err());

    // Schema restored: the retried cycle flushes the same changes.
    db.migrate().await.unwrap();
    sync_to_database(&db, &cache).await.unwrap();

    let settings = db.load_settings().await.unwrap();
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn new_memories_receive_database_ids() {
    let (db, cache, services) = test_env().await;
    let memory = services.add_memory(4, "prefers summaries", "user").await;
    assert!(memory.id < 0);

    sync_to_database(&db, &cache).await.unwrap();

    let cached = services.get_memories(4);
    assert_eq!(cached.len(), 1);
    assert!(cached[0].id > 0);

    let rows = db.load_memories().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "prefers summaries");
    assert_eq!(rows[0].source, "user");
}

#[tokio::test]
async fn pop_last_exchange_rewrites_persisted_rows() {
    let (db, cache, services) = test_env().await;
    let persona = services.get_current_persona_name(1);
    let session_id = services.ensure_session(1, &persona);

    services.add_user_message_to_session(session_id, "q1");
    services.add_assistant_message_to_session(session_id, "a1");
    services.add_user_message_to_session(session_id, "q2");
    services.add_assistant_message_to_session(session_id, "a2");
    sync_to_database(&db, &cache).await.unwrap();
    assert_eq!(db.load_conversations().await.unwrap().len(), 4);

    assert!(services.pop_last_exchange(session_id));
    sync_to_database(&db, &cache).await.unwrap();
    let rows = db.load_conversations().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].content, "a1");

    // Re-running the exchange restores the original count.
    services.add_user_message_to_session(session_id, "q2");
    services.add_assistant_message_to_session(session_id, "a2 again");
    sync_to_database(&db, &cache).await.unwrap();
    assert_eq!(db.load_conversations().await.unwrap().len(), 4);
}

#[tokio::test]
async fn persona_delete_cascades_in_database() {
    let (db, cache, services) = test_env().await;
    services.get_user_settings(5);
    services.create_persona(5, "coder", Some("You write code."));
    services.switch_persona(5, "coder");
    let session_id = services.ensure_session(5, "coder");
    services.add_user_message_to_session(session_id, "hi");
    services.add_token_usage(5, "coder", 10, 2);
    sync_to_database(&db, &cache).await.unwrap();

    services.delete_persona(5, "coder").unwrap();
    sync_to_database(&db, &cache).await.unwrap();

    assert!(db.load_personas().await.unwrap().iter().all(|p| p.name != "coder"));
    assert!(db.load_sessions().await.unwrap().iter().all(|s| s.persona_name != "coder"));
    assert!(db.load_conversations().await.unwrap().is_empty());
    assert!(db.load_persona_tokens().await.unwrap().iter().all(|t| t.persona_name != "coder"));
    assert_eq!(services.get_current_persona_name(5), "default");
}

#[tokio::test]
async fn loading_round_trips_the_cache_image() {
    let (db, cache, services) = test_env().await;
    services.set_model(2, "claude-sonnet");
    services.create_persona(2, "writer", Some("You write prose."));
    services.switch_persona(2, "writer");
    let session_id = services.ensure_session(2, "writer");
    services.add_user_message_to_session(session_id, "draft something");
    services.add_assistant_message_to_session(session_id, "done");
    services.add_token_usage(2, "writer", 42, 8);
    services.add_memory(2, "likes short sentences", "user").await;
    sync_to_database(&db, &cache).await.unwrap();

    // A fresh cache loaded from the same database sees the same state.
    let config = helpers::test_config();
    let fresh = std::sync::Arc::new(gemen::cache::CacheManager::new(
        gemen::cache::CacheDefaults::from_config(&config),
    ));
    gemen::cache::sync::load_from_database(&db, &fresh).await.unwrap();

    assert_eq!(fresh.get_settings(2).model, "claude-sonnet");
    assert!(fresh.get_persona(2, "writer").is_some());
    let sessions = fresh.get_sessions(2, "writer");
    assert_eq!(sessions.len(), 1);
    assert_eq!(fresh.get_conversation_by_session(sessions[0].id).len(), 2);
    assert_eq!(fresh.get_token_usage(2, "writer").total_tokens, 50);
    assert_eq!(fresh.get_memories(2).len(), 1);
}
