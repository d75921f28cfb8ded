//! Shared context properties: durability round-trips, serialized updates,
//! bounded history, and TTL eviction against the public API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use tutor_mesh::config::ContextConfig;
use tutor_mesh::context::{
    ContextMessage, ContextQuery, ContextUpdate, ContextStore, MemoryStore, MessageRole,
    SharedContextManager, SqliteStore, StudentProgress,
};

fn memory_manager() -> SharedContextManager {
    SharedContextManager::new(ContextConfig::default(), Arc::new(MemoryStore::new()))
}

// ========== Durability Round-trips ==========

#[tokio::test]
async fn test_roundtrip_through_sqlite_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("contexts.db")).unwrap());
    let manager = SharedContextManager::new(ContextConfig::default(), store);

    let progress = StudentProgress {
        topics_completed: vec!["fractions".into()],
        correct_answers: 8,
        total_answers: 10,
        mastery: HashMap::from([("fractions".to_string(), 0.8)]),
    };
    manager
        .initialize_context("session-1", "student-7", Some(progress))
        .await
        .unwrap();
    manager
        .update_context("session-1", ContextUpdate::Topic("decimals".into()))
        .await
        .unwrap();
    manager
        .add_message(
            "session-1",
            ContextMessage::new(MessageRole::Student, "student-7", json!("why ten digits?")),
        )
        .await
        .unwrap();
    let before = manager.get_context("session-1").await.unwrap().unwrap();

    // Simulated cache eviction: the next read must rebuild from the store.
    manager.evict_cached("session-1");
    let restored = manager.get_context("session-1").await.unwrap().unwrap();

    assert_eq!(restored, before);
    assert_eq!(restored.current_topic.as_deref(), Some("decimals"));
    assert_eq!(restored.student_progress.correct_answers, 8);
    assert_eq!(restored.conversation_history.len(), 1);
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("contexts.db");

    {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let manager = SharedContextManager::new(ContextConfig::default(), store);
        manager
            .initialize_context("session-1", "student-7", None)
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let manager = SharedContextManager::new(ContextConfig::default(), store);
    let restored = manager.get_context("session-1").await.unwrap().unwrap();
    assert_eq!(restored.user_id, "student-7");
}

// ========== Update Serialization ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_counter_increments_are_not_lost() {
    let manager = memory_manager();
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();

    let n: i64 = 100;
    let mut tasks = Vec::new();
    for _ in 0..n {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .update_with("session-1", |ctx| {
                    let current = ctx
                        .metadata
                        .get("counter")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    ctx.metadata.insert("counter".into(), json!(current + 1));
                })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let ctx = manager.get_context("session-1").await.unwrap().unwrap();
    assert_eq!(ctx.metadata.get("counter"), Some(&json!(n)));
}

// ========== Bounded History and Clamping ==========

#[tokio::test]
async fn test_history_never_exceeds_cap() {
    let config = ContextConfig {
        history_cap: 100,
        ..ContextConfig::default()
    };
    let manager = SharedContextManager::new(config, Arc::new(MemoryStore::new()));
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();

    for i in 0..105 {
        manager
            .add_message(
                "session-1",
                ContextMessage::new(MessageRole::Student, "student-7", json!({"seq": i})),
            )
            .await
            .unwrap();
    }

    let ctx = manager.get_context("session-1").await.unwrap().unwrap();
    assert_eq!(ctx.conversation_history.len(), 100);
    // The oldest five were dropped.
    assert_eq!(ctx.conversation_history[0].content, json!({"seq": 5}));
    assert_eq!(ctx.conversation_history[99].content, json!({"seq": 104}));
}

#[tokio::test]
async fn test_difficulty_clamps_at_both_ends() {
    let manager = memory_manager();
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();

    let ctx = manager
        .update_context("session-1", ContextUpdate::Difficulty(-3))
        .await
        .unwrap();
    assert_eq!(ctx.current_difficulty, 1);

    let ctx = manager
        .update_context("session-1", ContextUpdate::Difficulty(57))
        .await
        .unwrap();
    assert_eq!(ctx.current_difficulty, 10);
}

// ========== Search and Eviction ==========

#[tokio::test]
async fn test_search_by_user_and_topic() {
    let manager = memory_manager();
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();
    manager
        .initialize_context("session-2", "student-7", None)
        .await
        .unwrap();
    manager
        .update_context("session-1", ContextUpdate::Topic("fractions".into()))
        .await
        .unwrap();

    let for_user = manager
        .search_contexts(&ContextQuery::by_user("student-7"))
        .await
        .unwrap();
    assert_eq!(for_user.len(), 2);

    let for_topic = manager
        .search_contexts(&ContextQuery {
            user_id: Some("student-7".into()),
            topic: Some("fractions".into()),
            ..ContextQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(for_topic.len(), 1);
    assert_eq!(for_topic[0].session_id, "session-1");
}

#[tokio::test]
async fn test_session_search_falls_back_to_store_when_cold() {
    let manager = memory_manager();
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();
    manager.evict_cached("session-1");
    assert_eq!(manager.cached_count(), 0);

    let results = manager
        .search_contexts(&ContextQuery::by_session("session-1"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].session_id, "session-1");
}

#[tokio::test]
async fn test_expired_context_removed_from_cache_and_store() {
    let store = Arc::new(MemoryStore::new());
    let config = ContextConfig {
        ttl_secs: 0,
        ..ContextConfig::default()
    };
    let manager = SharedContextManager::new(config, store.clone());
    manager
        .initialize_context("session-1", "student-7", None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let evicted = manager.cleanup_expired_contexts().await;
    assert_eq!(evicted, vec!["session-1".to_string()]);
    assert_eq!(manager.cached_count(), 0);
    assert!(store.get("context:session-1").await.unwrap().is_none());
    assert!(manager.get_context("session-1").await.unwrap().is_none());
}
