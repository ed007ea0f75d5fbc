//! Ledger engine behavior against the in-memory store.
//!
//! Covers idempotent replay, the non-negative level rule, concurrent
//! conservation under both locking strategies, and retry behavior under
//! injected and real contention.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use proptest::prelude::*;
use quota_ledger_core::error::LedgerError;
use quota_ledger_core::store::ResourceStore;
use quota_ledger_core::types::{AccountId, MutationKind, MutationRequest, MutationStatus};
use quota_ledger_runtime::{EngineConfig, LedgerEngine, LockingStrategy, RetryPolicy};
use quota_ledger_testing::{ConflictInjectingStore, InMemoryStore, test_clock};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .backoff_range(Duration::from_millis(1), Duration::from_millis(3))
        .build()
}

fn engine_over(store: Arc<dyn ResourceStore>, strategy: LockingStrategy) -> LedgerEngine {
    LedgerEngine::new(
        store,
        Arc::new(test_clock()),
        EngineConfig::with_strategy(strategy).retry(fast_retry(50)),
    )
}

fn setup(level: i64, strategy: LockingStrategy) -> (Arc<InMemoryStore>, AccountId, LedgerEngine) {
    let store = Arc::new(InMemoryStore::new());
    let account = store.seed_account(level);
    let engine = engine_over(store.clone(), strategy);
    (store, account, engine)
}

#[tokio::test]
async fn charge_then_replay_applies_once() {
    let (store, account, engine) = setup(100, LockingStrategy::Pessimistic);

    let first = engine
        .apply(account, "k1", 30, MutationKind::Decrease)
        .await
        .unwrap();
    assert_eq!(first.status, MutationStatus::Succeeded);
    assert_eq!(first.delta, -30);
    assert_eq!(store.level_of(account), Some(70));

    let replay = engine
        .apply(account, "k1", 30, MutationKind::Decrease)
        .await
        .unwrap();
    assert_eq!(replay, first);
    assert_eq!(store.level_of(account), Some(70));
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn insufficient_level_leaves_no_trace() {
    let (store, account, engine) = setup(10, LockingStrategy::Pessimistic);

    let err = engine
        .apply(account, "k2", 50, MutationKind::Decrease)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LedgerError::InsufficientResource {
            account_id: account,
            level: 10,
            requested: 50,
        }
    );
    assert_eq!(store.level_of(account), Some(10));
    assert!(store.record("k2").is_none());

    // The key is still usable once the level allows it.
    engine
        .apply(account, "k2", 10, MutationKind::Decrease)
        .await
        .unwrap();
    assert_eq!(store.level_of(account), Some(0));
}

#[tokio::test]
async fn two_workers_drain_the_account_exactly() {
    let (store, account, engine) = setup(100, LockingStrategy::Pessimistic);
    let policy = fast_retry(5);

    let (a, b) = tokio::join!(
        engine.apply_with_retry(account, "worker-a", 60, MutationKind::Decrease, &policy),
        engine.apply_with_retry(account, "worker-b", 40, MutationKind::Decrease, &policy),
    );

    assert_eq!(a.unwrap().status, MutationStatus::Succeeded);
    assert_eq!(b.unwrap().status, MutationStatus::Succeeded);
    assert_eq!(store.level_of(account), Some(0));
}

#[tokio::test]
async fn deposit_increases_level() {
    let (store, account, engine) = setup(0, LockingStrategy::Pessimistic);

    let record = engine
        .apply(account, "dep-1", 25, MutationKind::Increase)
        .await
        .unwrap();

    assert_eq!(record.delta, 25);
    assert_eq!(record.kind, MutationKind::Increase);
    assert_eq!(store.level_of(account), Some(25));
}

#[tokio::test]
async fn invalid_input_never_reaches_the_store() {
    let inner = Arc::new(InMemoryStore::new());
    let account = inner.seed_account(10);
    let counting = Arc::new(ConflictInjectingStore::new(inner.clone(), 0));
    let engine = engine_over(counting.clone(), LockingStrategy::Pessimistic);

    assert_eq!(
        engine.apply(account, "k", 0, MutationKind::Decrease).await,
        Err(LedgerError::InvalidAmount(0))
    );
    assert_eq!(
        engine.apply(account, "k", -4, MutationKind::Increase).await,
        Err(LedgerError::InvalidAmount(-4))
    );
    assert!(matches!(
        engine.apply(account, "   ", 1, MutationKind::Decrease).await,
        Err(LedgerError::InvalidIdempotencyKey(_))
    ));
    assert!(matches!(
        engine
            .apply(account, &"x".repeat(256), 1, MutationKind::Decrease)
            .await,
        Err(LedgerError::InvalidIdempotencyKey(_))
    ));
    assert_eq!(counting.transactions(), 0);
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let (store, _, engine) = setup(10, LockingStrategy::Pessimistic);
    let missing = AccountId::new();

    let err = engine
        .apply(missing, "k", 1, MutationKind::Decrease)
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::AccountNotFound(missing));
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn overflowing_deposit_is_rejected() {
    let (store, account, engine) = setup(i64::MAX - 1, LockingStrategy::Pessimistic);

    let err = engine
        .apply(account, "big", 2, MutationKind::Increase)
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::InvalidAmount(2));
    assert_eq!(store.level_of(account), Some(i64::MAX - 1));
}

#[tokio::test]
async fn replay_with_different_payload_returns_stored_record() {
    let (store, account, engine) = setup(100, LockingStrategy::Pessimistic);

    let original = engine
        .apply(account, "k1", 30, MutationKind::Decrease)
        .await
        .unwrap();
    let replay = engine
        .apply(account, "k1", 99, MutationKind::Increase)
        .await
        .unwrap();

    assert_eq!(replay, original);
    assert_eq!(store.level_of(account), Some(70));
}

#[tokio::test]
async fn retry_succeeds_after_injected_conflicts() {
    let inner = Arc::new(InMemoryStore::new());
    let account = inner.seed_account(100);
    let flaky = Arc::new(ConflictInjectingStore::new(inner.clone(), 3));
    let engine = engine_over(flaky.clone(), LockingStrategy::Pessimistic);

    let record = engine
        .apply_with_retry(account, "k1", 30, MutationKind::Decrease, &fast_retry(5))
        .await
        .unwrap();

    assert_eq!(record.status, MutationStatus::Succeeded);
    assert_eq!(flaky.injected(), 3);
    assert_eq!(flaky.transactions(), 4);
    assert_eq!(inner.level_of(account), Some(70));
    assert_eq!(inner.records().len(), 1);
}

#[tokio::test]
async fn rearmed_conflicts_apply_to_the_next_call() {
    let inner = Arc::new(InMemoryStore::new());
    let account = inner.seed_account(100);
    let flaky = Arc::new(ConflictInjectingStore::new(inner.clone(), 0));
    let engine = engine_over(flaky.clone(), LockingStrategy::Optimistic);

    engine
        .apply_with_retry(account, "first", 10, MutationKind::Decrease, &fast_retry(3))
        .await
        .unwrap();
    assert_eq!(flaky.injected(), 0);
    assert_eq!(flaky.transactions(), 1);

    flaky.fail_next(2);
    assert_eq!(flaky.remaining(), 2);
    engine
        .apply_with_retry(account, "second", 10, MutationKind::Decrease, &fast_retry(3))
        .await
        .unwrap();

    assert_eq!(flaky.remaining(), 0);
    assert_eq!(flaky.injected(), 2);
    assert_eq!(flaky.transactions(), 4);
    assert_eq!(inner.level_of(account), Some(80));

    flaky.fail_next(3);
    let err = engine
        .apply_with_retry(account, "third", 10, MutationKind::Decrease, &fast_retry(3))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(inner.level_of(account), Some(80));
}

#[tokio::test]
async fn persistent_conflicts_exhaust_retries() {
    let inner = Arc::new(InMemoryStore::new());
    let account = inner.seed_account(100);
    let flaky = Arc::new(ConflictInjectingStore::new(inner.clone(), u32::MAX));
    let engine = engine_over(flaky.clone(), LockingStrategy::Optimistic);

    let err = engine
        .apply_with_retry(account, "k1", 30, MutationKind::Decrease, &fast_retry(3))
        .await
        .unwrap_err();

    match err {
        LedgerError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, LedgerError::WriteConflict(_)));
        },
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(flaky.transactions(), 3);
    assert_eq!(inner.level_of(account), Some(100));
    assert!(inner.records().is_empty());
}

#[tokio::test]
async fn business_errors_are_not_retried() {
    let inner = Arc::new(InMemoryStore::new());
    let account = inner.seed_account(5);
    let counting = Arc::new(ConflictInjectingStore::new(inner.clone(), 0));
    let engine = engine_over(counting.clone(), LockingStrategy::Pessimistic);

    let err = engine
        .apply_with_retry(account, "k", 6, MutationKind::Decrease, &fast_retry(5))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientResource { .. }));
    assert_eq!(counting.transactions(), 1);
}

#[tokio::test]
async fn held_row_lock_times_out_and_exhausts() {
    let store = Arc::new(InMemoryStore::new().with_lock_timeout(Duration::from_millis(10)));
    let account = store.seed_account(100);
    let engine = engine_over(store.clone(), LockingStrategy::Pessimistic);

    let mut holder = store.begin().await.unwrap();
    holder.lock_and_read_account(account).await.unwrap();

    let single = engine
        .apply(account, "blocked", 1, MutationKind::Decrease)
        .await
        .unwrap_err();
    assert!(matches!(single, LedgerError::LockTimeout(_)));

    let retried = engine
        .apply_with_retry(account, "blocked", 1, MutationKind::Decrease, &fast_retry(2))
        .await
        .unwrap_err();
    assert!(matches!(
        retried,
        LedgerError::RetriesExhausted { attempts: 2, .. }
    ));

    holder.rollback().await.unwrap();
    engine
        .apply(account, "blocked", 1, MutationKind::Decrease)
        .await
        .unwrap();
    assert_eq!(store.level_of(account), Some(99));
}

#[tokio::test]
async fn submit_classifies_intent() {
    let (store, account, engine) = setup(50, LockingStrategy::Pessimistic);

    let request = |intent: &str, key: &str, amount: i64| MutationRequest {
        account_id: account,
        idempotency_key: key.to_string(),
        amount,
        intent: intent.to_string(),
    };

    engine.submit(&request("purchase", "p1", 20)).await.unwrap();
    engine.submit(&request("DEPOSIT", "d1", 5)).await.unwrap();
    assert_eq!(
        engine.submit(&request("REFUND", "r1", 5)).await,
        Err(LedgerError::InvalidIntent("REFUND".to_string()))
    );

    assert_eq!(store.level_of(account), Some(35));
    assert!(store.record("r1").is_none());
}

async fn run_concurrent(strategy: LockingStrategy, initial: i64, deltas: Vec<(MutationKind, i64)>) {
    let (store, account, engine) = setup(initial, strategy);
    let engine = Arc::new(engine);

    let handles: Vec<_> = deltas
        .iter()
        .enumerate()
        .map(|(i, &(kind, amount))| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let policy = *engine.config();
                let outcome = engine
                    .apply_with_retry(account, &format!("op-{i}"), amount, kind, &policy.retry)
                    .await;
                (kind.signed(quota_ledger_core::types::Amount::new(amount).unwrap()), outcome)
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked"))
        .collect();

    let mut applied = 0_i64;
    let mut succeeded = 0_usize;
    for (delta, outcome) in &results {
        match outcome {
            Ok(record) => {
                assert_eq!(record.status, MutationStatus::Succeeded);
                applied += delta;
                succeeded += 1;
            },
            Err(LedgerError::InsufficientResource { .. }) => {},
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }

    assert_eq!(store.level_of(account), Some(initial + applied));
    assert_eq!(store.records().len(), succeeded);
    assert!(store.level_of(account).unwrap() >= 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_charges_conserve_level_pessimistic() {
    let deltas = (0..40)
        .map(|i| {
            if i % 4 == 0 {
                (MutationKind::Increase, 3)
            } else {
                (MutationKind::Decrease, 7)
            }
        })
        .collect();
    run_concurrent(LockingStrategy::Pessimistic, 100, deltas).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_charges_conserve_level_optimistic() {
    let deltas = (0..40)
        .map(|i| {
            if i % 4 == 0 {
                (MutationKind::Increase, 3)
            } else {
                (MutationKind::Decrease, 7)
            }
        })
        .collect();
    run_concurrent(LockingStrategy::Optimistic, 100, deltas).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_sells_once() {
    let (store, account, engine) = setup(1, LockingStrategy::Optimistic);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .apply_with_retry(
                        account,
                        &format!("buyer-{i}"),
                        1,
                        MutationKind::Decrease,
                        &fast_retry(100),
                    )
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked"))
        .collect();

    let sold = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientResource { .. })))
        .count();

    assert_eq!(sold, 1);
    assert_eq!(rejected, 49);
    assert_eq!(store.level_of(account), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_apply_once() {
    let (store, account, engine) = setup(100, LockingStrategy::Pessimistic);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .apply(account, "same-key", 10, MutationKind::Decrease)
                    .await
            })
        })
        .collect();

    let records: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked").expect("apply failed"))
        .collect();

    assert!(records.iter().all(|r| r.id == records[0].id));
    assert_eq!(store.level_of(account), Some(90));
    assert_eq!(store.records().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn repeated_key_changes_level_once(initial in 0_i64..1_000, amount in 1_i64..500, repeats in 1_usize..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (store, account, engine) = setup(initial, LockingStrategy::Pessimistic);
            let mut outcomes = Vec::new();
            for _ in 0..repeats {
                outcomes.push(engine.apply(account, "same", amount, MutationKind::Decrease).await);
            }

            let expected = if amount <= initial { initial - amount } else { initial };
            prop_assert_eq!(store.level_of(account), Some(expected));
            if amount <= initial {
                prop_assert!(outcomes.iter().all(|o| o.as_ref().ok() == outcomes[0].as_ref().ok()));
                prop_assert_eq!(store.records().len(), 1);
            } else {
                let all_rejected = outcomes
                    .iter()
                    .all(|o| matches!(o, Err(LedgerError::InsufficientResource { .. })));
                prop_assert!(all_rejected);
                prop_assert!(store.records().is_empty());
            }
            Ok(())
        })?;
    }
}
