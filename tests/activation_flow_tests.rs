use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use user_activator::{
    config::MigrationMode,
    db,
    models::ChangeEvent,
    repositories::{DocumentStore, SqliteDocumentStore},
    services::{ActivationOutcome, ActivationService, MigrationError, RecordMigrator},
    test_utils::test_helpers::{
        self, document, insert_pending_user, verification_event, FaultyStore,
        RecordingEmailService,
    },
};

struct Harness {
    store: Arc<FaultyStore>,
    email: Arc<RecordingEmailService>,
    service: ActivationService,
}

async fn harness(mode: MigrationMode, email: RecordingEmailService) -> Harness {
    let pool = test_helpers::create_test_db().await.unwrap();
    let sqlite: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool));
    let store = Arc::new(FaultyStore::new(sqlite));
    let email = Arc::new(email);

    let migrator = RecordMigrator::new(store.clone(), "pending_users", "verified_users", mode);
    let service = ActivationService::new(migrator, email.clone());

    Harness {
        store,
        email,
        service,
    }
}

#[tokio::test]
async fn test_verified_user_is_moved_and_notified() {
    for mode in [MigrationMode::Sequential, MigrationMode::Transactional] {
        let h = harness(mode, RecordingEmailService::new()).await;
        insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
            .await
            .unwrap();

        let event = verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al", "plan": "pro" }),
        );
        let outcome = h.service.handle_event(&event).await;
        assert!(matches!(outcome, ActivationOutcome::Activated { .. }), "{:?}", mode);

        assert!(h.store.get("pending_users", "u1").await.unwrap().is_none());
        let verified = h.store.get("verified_users", "u1").await.unwrap().unwrap();
        assert_eq!(verified["activated"], json!(true));
        assert_eq!(verified["verified"], json!(true));
        assert_eq!(verified["plan"], json!("pro"));
        assert!(verified["approvedAt"].as_str().is_some());

        let sent = h.email.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.com");
        assert!(sent[0].text.contains("Hi Al,"));
        assert!(sent[0].html.contains("<strong>Al</strong>"));
    }
}

#[tokio::test]
async fn test_exactly_one_write_delete_and_mail() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();

    h.service
        .handle_event(&verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al" }),
        ))
        .await;

    assert_eq!(h.store.sets.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.email.attempts(), 1);
}

#[tokio::test]
async fn test_missing_name_defaults_to_user() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u2", "nameless@b.com", None)
        .await
        .unwrap();

    h.service
        .handle_event(&verification_event(
            1,
            "u2",
            json!({ "verified": true, "email": "nameless@b.com" }),
        ))
        .await;

    let sent = h.email.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.starts_with("Hi User,"));
}

#[tokio::test]
async fn test_non_transitions_touch_nothing() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();

    let events = [
        (Some(json!({ "verified": true })), Some(json!({ "verified": true }))),
        (Some(json!({ "verified": false })), Some(json!({ "verified": false, "name": "Bo" }))),
        (None, Some(json!({ "verified": true }))),
        (Some(json!({ "verified": false })), None),
        (Some(json!({})), Some(json!({ "verified": true }))),
    ];

    for (seq, (before, after)) in events.into_iter().enumerate() {
        let event = ChangeEvent {
            seq: seq as i64 + 1,
            namespace: "pending_users".to_string(),
            document_id: "u1".to_string(),
            before: before.map(document),
            after: after.map(document),
        };
        let outcome = h.service.handle_event(&event).await;
        assert!(matches!(outcome, ActivationOutcome::Ignored));
    }

    assert_eq!(h.store.sets.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.email.attempts(), 0);
    assert!(h.store.get("pending_users", "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_redelivered_event_is_a_no_op() {
    for mode in [MigrationMode::Sequential, MigrationMode::Transactional] {
        let h = harness(mode, RecordingEmailService::new()).await;
        insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
            .await
            .unwrap();
        let event = verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al" }),
        );

        let first = h.service.handle_event(&event).await;
        let first_approved = h.store.get("verified_users", "u1").await.unwrap().unwrap();
        let second = h.service.handle_event(&event).await;

        assert!(matches!(first, ActivationOutcome::Activated { .. }));
        assert!(matches!(second, ActivationOutcome::AlreadyActivated));
        assert_eq!(h.store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(h.email.attempts(), 1);
        assert_eq!(
            h.store.get("verified_users", "u1").await.unwrap().unwrap(),
            first_approved
        );
    }
}

#[tokio::test]
async fn test_mail_failure_does_not_undo_migration() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::failing()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();

    let outcome = h
        .service
        .handle_event(&verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al" }),
        ))
        .await;

    assert!(matches!(outcome, ActivationOutcome::NotificationFailed { .. }));
    assert_eq!(h.email.attempts(), 1);
    assert!(h.store.get("pending_users", "u1").await.unwrap().is_none());
    assert!(h.store.get("verified_users", "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_write_failure_prevents_delete_and_mail() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();
    h.store.fail_set.store(true, Ordering::SeqCst);

    let outcome = h
        .service
        .handle_event(&verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al" }),
        ))
        .await;

    assert!(matches!(
        outcome,
        ActivationOutcome::MigrationFailed(MigrationError::WriteFailed(_))
    ));
    assert_eq!(h.store.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.email.attempts(), 0);
    assert!(h.store.get("pending_users", "u1").await.unwrap().is_some());
    assert!(h.store.get("verified_users", "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_failure_leaves_duplicate_and_skips_mail() {
    let h = harness(MigrationMode::Sequential, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();
    h.store.fail_delete.store(true, Ordering::SeqCst);

    let outcome = h
        .service
        .handle_event(&verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com", "name": "Al" }),
        ))
        .await;

    assert!(matches!(
        outcome,
        ActivationOutcome::MigrationFailed(MigrationError::DeleteFailed(_))
    ));
    assert_eq!(h.email.attempts(), 0);
    assert!(h.store.get("pending_users", "u1").await.unwrap().is_some());
    assert!(h.store.get("verified_users", "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_transactional_write_failure_keeps_pending_record() {
    let h = harness(MigrationMode::Transactional, RecordingEmailService::new()).await;
    insert_pending_user(h.store.as_ref(), "u1", "a@b.com", Some("Al"))
        .await
        .unwrap();
    h.store.fail_set.store(true, Ordering::SeqCst);

    let outcome = h
        .service
        .handle_event(&verification_event(
            1,
            "u1",
            json!({ "verified": true, "email": "a@b.com" }),
        ))
        .await;

    assert!(matches!(
        outcome,
        ActivationOutcome::MigrationFailed(MigrationError::MoveFailed(_))
    ));
    assert_eq!(h.email.attempts(), 0);
    assert!(h.store.get("pending_users", "u1").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_transactional_activations_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let database_url = format!("sqlite://{}", dir.path().join("activator.db").display());
    let pool = db::create_pool(&database_url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool));
    let email = Arc::new(RecordingEmailService::new());
    let migrator = RecordMigrator::new(
        store.clone(),
        "pending_users",
        "verified_users",
        MigrationMode::Transactional,
    );
    let service = Arc::new(ActivationService::new(migrator, email.clone()));

    let users: Vec<String> = (0..40).map(|i| format!("u{}", i)).collect();
    for (i, id) in users.iter().enumerate() {
        insert_pending_user(store.as_ref(), id, &format!("user{}@b.com", i), None)
            .await
            .unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for (i, id) in users.iter().enumerate() {
        let service = service.clone();
        let event = verification_event(
            i as i64 + 1,
            id,
            json!({ "verified": true, "email": format!("user{}@b.com", i) }),
        );
        tasks.spawn(async move { service.handle_event(&event).await });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap();
        if !matches!(outcome, ActivationOutcome::Activated { .. }) {
            failures.push(format!("{:?}", outcome));
        }
    }

    assert!(failures.is_empty(), "{:?}", failures);
    assert!(store.list("pending_users", None, None).await.unwrap().is_empty());
    assert_eq!(store.list("verified_users", None, None).await.unwrap().len(), 40);
    assert_eq!(email.attempts(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_updates_are_all_applied() {
    let dir = tempfile::tempdir().unwrap();
    let database_url = format!("sqlite://{}", dir.path().join("activator.db").display());
    let pool = db::create_pool(&database_url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool));
    insert_pending_user(store.as_ref(), "u1", "a@b.com", None)
        .await
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..20 {
        let store = store.clone();
        tasks.spawn(async move {
            store
                .update("pending_users", "u1", document(json!({ (format!("f{}", i)): i })))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let record = store.get("pending_users", "u1").await.unwrap().unwrap();
    for i in 0..20 {
        assert_eq!(record[&format!("f{}", i)], json!(i));
    }
}
