//! Storage layer tests for the pushsub hub.

#![allow(clippy::unwrap_used)]

use pushsub_core::store::{StoreError, SubscriptionStore};
use pushsub_core::{Renewal, RetryState, StateUpdate, Subscriber};

use super::HubDatabase;

async fn test_db() -> HubDatabase {
    HubDatabase::open_in_memory().await.unwrap()
}

fn sub(id: &str, owner: &str, callback: &str, state: RetryState) -> Subscriber {
    let renewal = Renewal {
        owner_id: owner.into(),
        nickname: format!("nick-{id}"),
        subscribe: true,
        callback_url: callback.into(),
        topic: "https://example.com/feed".into(),
        secret: "s3cret".into(),
    };
    let mut sub = Subscriber::renewed(id.into(), &renewal, None, 1_000);
    sub.state = state;
    sub
}

// === Encoding ===

#[tokio::test]
async fn states_round_trip_through_numeric_column() {
    let db = test_db().await;
    let states = [
        RetryState::Idle,
        RetryState::Pending,
        RetryState::Retrying { failures: 1 },
        RetryState::Retrying { failures: 13 },
        RetryState::Terminated,
    ];
    for (i, state) in states.into_iter().enumerate() {
        let id = format!("s{i}");
        db.upsert(&sub(&id, "o1", &format!("https://cb/{i}"), state)).await.unwrap();
        assert_eq!(db.get_by_id(&id).await.unwrap().unwrap().state, state);
    }

    let row = db.subscriber_row("s3").await.unwrap().unwrap();
    assert_eq!(row.retry_state, 14);
}

#[tokio::test]
async fn any_negative_code_reads_as_terminated() {
    let db = test_db().await;
    db.upsert(&sub("s", "o1", "https://a", RetryState::Idle)).await.unwrap();
    sqlx::query("UPDATE subscribers SET retry_state = -7 WHERE id = 's'")
        .execute(db.pool())
        .await
        .unwrap();

    assert_eq!(db.get_by_id("s").await.unwrap().unwrap().state, RetryState::Terminated);
    assert_eq!(db.count_by_state().await.unwrap().terminated, 1);
    assert!(db.list_due(i64::MAX).await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_code_is_corrupt() {
    let db = test_db().await;
    db.upsert(&sub("s", "o1", "https://a", RetryState::Idle)).await.unwrap();
    sqlx::query("UPDATE subscribers SET retry_state = 99999999999 WHERE id = 's'")
        .execute(db.pool())
        .await
        .unwrap();

    let err = db.get_by_id("s").await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[tokio::test]
async fn secret_and_schedule_are_persisted() {
    let db = test_db().await;
    let mut s = sub("s", "o1", "https://a", RetryState::Retrying { failures: 2 });
    s.next_attempt_at = Some(5_000);
    db.upsert(&s).await.unwrap();

    let loaded = db.get_by_callback("https://a").await.unwrap().unwrap();
    assert_eq!(loaded, s);
    assert_eq!(loaded.secret, "s3cret");
}

// === Queries ===

#[tokio::test]
async fn upsert_evicts_other_id_with_same_callback() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://same", RetryState::Idle)).await.unwrap();
    db.upsert(&sub("b", "o1", "https://same", RetryState::Pending)).await.unwrap();

    assert!(db.get_by_id("a").await.unwrap().is_none());
    assert_eq!(db.get_by_callback("https://same").await.unwrap().unwrap().id, "b");
}

#[tokio::test]
async fn due_listing_honours_state_and_schedule() {
    let db = test_db().await;
    db.upsert(&sub("idle", "o1", "https://1", RetryState::Idle)).await.unwrap();
    db.upsert(&sub("pending", "o1", "https://2", RetryState::Pending)).await.unwrap();
    let mut later = sub("later", "o1", "https://3", RetryState::Retrying { failures: 1 });
    later.next_attempt_at = Some(5_000);
    db.upsert(&later).await.unwrap();
    db.upsert(&sub("dead", "o1", "https://4", RetryState::Terminated)).await.unwrap();

    let due: Vec<_> = db.list_due(4_999).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(due, vec!["pending"]);
    let due: Vec<_> = db.list_due(5_000).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(due, vec!["pending", "later"]);
}

#[tokio::test]
async fn owner_listings() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://a", RetryState::Idle)).await.unwrap();
    db.upsert(&sub("b", "o2", "https://b", RetryState::Idle)).await.unwrap();
    db.upsert(&sub("c", "o1", "https://c", RetryState::Pending)).await.unwrap();

    let idle = db.list_idle_by_owner("o1").await.unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].id, "a");
    assert_eq!(db.list_by_owner("o1").await.unwrap().len(), 2);
    assert!(db.list_by_owner("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn update_state_is_compare_and_set() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://a", RetryState::Pending)).await.unwrap();
    let retry = StateUpdate {
        state: RetryState::Retrying { failures: 1 },
        next_attempt_at: Some(9_000),
        last_update_at: None,
    };

    assert!(!db.update_state("a", Some(1), &retry).await.unwrap());
    assert!(db.update_state("a", Some(0), &retry).await.unwrap());
    assert!(!db.update_state("a", Some(0), &retry).await.unwrap());
    assert!(!db.update_state("missing", None, &retry).await.unwrap());

    let loaded = db.get_by_id("a").await.unwrap().unwrap();
    assert_eq!(loaded.state, RetryState::Retrying { failures: 1 });
    assert_eq!(loaded.next_attempt_at, Some(9_000));
    assert_eq!(loaded.last_update_at, 1_000);
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn stale_version_loses_after_state_round_trip() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://a", RetryState::Pending)).await.unwrap();
    let observed = db.get_by_id("a").await.unwrap().unwrap();

    let delivered = StateUpdate {
        state: RetryState::Idle,
        next_attempt_at: None,
        last_update_at: Some(observed.last_update_at),
    };
    assert!(db.update_state("a", None, &delivered).await.unwrap());
    let to_pending = StateUpdate::unconstrained(RetryState::Pending);
    assert!(db.update_state("a", None, &to_pending).await.unwrap());

    let retry = StateUpdate {
        state: RetryState::Retrying { failures: 1 },
        next_attempt_at: Some(9_000),
        last_update_at: None,
    };
    assert!(!db.update_state("a", Some(observed.version), &retry).await.unwrap());

    let loaded = db.get_by_id("a").await.unwrap().unwrap();
    assert_eq!(loaded.state, RetryState::Pending);
    assert_eq!(loaded.next_attempt_at, None);
    assert_eq!(loaded.version, observed.version + 2);
}

#[tokio::test]
async fn update_state_writes_watermark_and_clears_terminated_schedule() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://a", RetryState::Pending)).await.unwrap();

    let delivered = StateUpdate {
        state: RetryState::Idle,
        next_attempt_at: None,
        last_update_at: Some(7_000),
    };
    assert!(db.update_state("a", None, &delivered).await.unwrap());
    assert_eq!(db.get_by_id("a").await.unwrap().unwrap().last_update_at, 7_000);

    let terminate = StateUpdate {
        state: RetryState::Terminated,
        next_attempt_at: Some(1),
        last_update_at: None,
    };
    assert!(db.update_state("a", None, &terminate).await.unwrap());
    let loaded = db.get_by_id("a").await.unwrap().unwrap();
    assert_eq!(loaded.state, RetryState::Terminated);
    assert_eq!(loaded.next_attempt_at, None);
    assert_eq!(loaded.last_update_at, 7_000);
}

#[tokio::test]
async fn replace_swaps_rows_atomically() {
    let db = test_db().await;
    db.upsert(&sub("old", "o1", "https://a", RetryState::Retrying { failures: 3 }))
        .await
        .unwrap();

    let replaced = db
        .replace("https://a", &|prev| {
            let prev = prev.unwrap();
            let mut next = sub("new", &prev.owner_id, &prev.callback_url, RetryState::Idle);
            next.state = prev.state.capped_for_renewal();
            Some(next)
        })
        .await
        .unwrap();

    assert_eq!(replaced.previous.unwrap().id, "old");
    assert_eq!(replaced.current.unwrap().state, RetryState::Pending);
    assert!(db.get_by_id("old").await.unwrap().is_none());
    assert_eq!(db.get_by_callback("https://a").await.unwrap().unwrap().id, "new");
}

#[tokio::test]
async fn replace_with_nothing_deletes() {
    let db = test_db().await;
    db.upsert(&sub("old", "o1", "https://a", RetryState::Idle)).await.unwrap();

    let replaced = db.replace("https://a", &|_| None).await.unwrap();
    assert!(replaced.previous.is_some());
    assert!(replaced.current.is_none());
    assert!(db.get_by_callback("https://a").await.unwrap().is_none());

    let replaced = db.replace("https://a", &|_| None).await.unwrap();
    assert_eq!(replaced, pushsub_core::Replaced::default());
}

#[tokio::test]
async fn delete_by_callback_returns_removed_row() {
    let db = test_db().await;
    db.upsert(&sub("a", "o1", "https://a", RetryState::Idle)).await.unwrap();

    assert_eq!(db.delete_by_callback("https://a").await.unwrap().unwrap().id, "a");
    assert!(db.delete_by_callback("https://a").await.unwrap().is_none());
}

#[tokio::test]
async fn prune_and_counts() {
    let db = test_db().await;
    let mut stale = sub("stale", "o1", "https://1", RetryState::Terminated);
    stale.renewed_at = 10;
    db.upsert(&stale).await.unwrap();
    db.upsert(&sub("fresh", "o1", "https://2", RetryState::Terminated)).await.unwrap();
    db.upsert(&sub("idle", "o1", "https://3", RetryState::Idle)).await.unwrap();
    db.upsert(&sub("retry", "o1", "https://4", RetryState::Retrying { failures: 2 }))
        .await
        .unwrap();

    assert_eq!(db.delete_terminated(500).await.unwrap(), 1);

    let counts = db.count_by_state().await.unwrap();
    assert_eq!(counts.idle, 1);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.retrying, 1);
    assert_eq!(counts.terminated, 1);
    assert_eq!(counts.total(), 3);
}

#[tokio::test]
async fn counts_on_empty_database_are_zero() {
    let db = test_db().await;
    assert_eq!(db.count_by_state().await.unwrap().total(), 0);
    assert_eq!(db.count_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.db");

    {
        let db = HubDatabase::open(&path).await.unwrap();
        db.upsert(&sub("a", "o1", "https://a", RetryState::Pending)).await.unwrap();
        db.enqueue_job("a", "deliver", 10, 1_000).await.unwrap();
        db.pool().close().await;
    }

    let db = HubDatabase::open(&path).await.unwrap();
    assert_eq!(db.get_by_id("a").await.unwrap().unwrap().state, RetryState::Pending);
    assert_eq!(db.count_jobs().await.unwrap(), 1);
}
