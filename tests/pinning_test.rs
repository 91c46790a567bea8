//! Context pinning: a turn keeps writing to the persona and session captured
//! at its start, across persona switches and even across a sync that remaps
//! the session's temporary id.

mod helpers;

use gemen::cache::sync::sync_to_database;
use helpers::test_env;

#[tokio::test]
async fn writes_attribute_to_pinned_persona_and_session() {
    let (_db, _cache, services) = test_env().await;
    services.get_user_settings(1);
    services.create_persona(1, "p2", Some("Second persona."));

    // Turn starts: pin the current persona and session.
    let pinned_persona = services.get_current_persona_name(1);
    assert_eq!(pinned_persona, "default");
    let pinned_session = services.ensure_session(1, &pinned_persona);

    // The user switches personas while the turn is in flight.
    services.switch_persona(1, "p2");
    let other_session = services.ensure_session(1, "p2");
    assert_ne!(pinned_session, other_session);

    // The turn finishes and writes to its pinned targets.
    services.add_user_message_to_session(pinned_session, "write 200 words about cats");
    services.add_assistant_message_to_session(pinned_session, "Cats are...");
    services.add_token_usage(1, &pinned_persona, 120, 250);

    let pinned_conv = services.get_conversation(pinned_session);
    assert_eq!(pinned_conv.len(), 2);
    assert_eq!(pinned_conv[0].role, "user");
    assert_eq!(pinned_conv[1].role, "assistant");
    assert!(services.get_conversation(other_session).is_empty());

    assert_eq!(services.get_token_usage(1, "default").total_tokens, 370);
    assert_eq!(services.get_token_usage(1, "p2").total_tokens, 0);

    // The user's "current" pointer still moved.
    assert_eq!(services.get_current_persona_name(1), "p2");
}

#[tokio::test]
async fn pinned_temporary_id_survives_a_mid_turn_sync() {
    let (db, cache, services) = test_env().await;
    let persona = services.get_current_persona_name(1);
    let pinned = services.ensure_session(1, &persona);
    assert!(pinned < 0);
    services.add_user_message_to_session(pinned, "question");

    // The background sync fires mid-turn and remaps the temporary id.
    sync_to_database(&db, &cache).await.unwrap();
    let db_id = services.get_sessions(1, &persona)[0].id;
    assert!(db_id > 0);

    // The turn still holds the temporary id; its write must land in the
    // remapped session.
    services.add_assistant_message_to_session(pinned, "answer");
    let conversation = services.get_conversation(db_id);
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[1].content, "answer");

    sync_to_database(&db, &cache).await.unwrap();
    let rows = db.load_conversations().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.session_id == db_id));
}

#[tokio::test]
async fn token_totals_keep_the_sum_invariant() {
    let (_db, _cache, services) = test_env().await;
    services.get_user_settings(1);
    services.create_persona(1, "research", None);
    services.add_token_usage(1, "default", 100, 40);
    services.add_token_usage(1, "research", 10, 5);
    services.add_token_usage(1, "default", 7, 3);

    for persona in ["default", "research"] {
        let usage = services.get_token_usage(1, persona);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }
    assert_eq!(services.get_total_tokens(1), 165);
}

#[tokio::test]
async fn quota_preflight_reads_the_global_sum() {
    let (_db, _cache, services) = test_env().await;
    services.get_user_settings(1);
    assert_eq!(services.get_remaining_tokens(1), None);

    services.set_token_limit(1, 100).unwrap();
    services.create_persona(1, "other", None);
    services.add_token_usage(1, "default", 60, 0);
    services.add_token_usage(1, "other", 30, 10);

    assert_eq!(services.get_remaining_tokens(1), Some(0));
    assert_eq!(services.get_usage_percentage(1), Some(100.0));
}
