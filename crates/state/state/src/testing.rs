//! Backend-agnostic conformance checks.
//!
//! Every `StateStore`, `DistributedLock`, and `RetryStateStore` backend runs
//! these from its own test module against a fresh instance.

use std::time::Duration;

use chrono::Utc;
use mender_core::{ActionId, OrganizationId, RetryState};

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};
use crate::lock::DistributedLock;
use crate::retry::RetryStateStore;
use crate::store::{CasResult, StateStore};

const ORG: &str = "conformance-org";

fn test_key(kind: KeyKind, id: &str) -> StateKey {
    StateKey::new(ORG, kind, id)
}

/// Run the full state store conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn StateStore) -> Result<(), StateError> {
    test_get_missing(store).await?;
    test_set_and_get(store).await?;
    test_check_and_set_new(store).await?;
    test_check_and_set_existing(store).await?;
    test_delete(store).await?;
    test_versions_increase(store).await?;
    test_compare_and_swap(store).await?;
    test_compare_and_swap_missing(store).await?;
    test_ttl_set(store).await?;
    test_scan_is_scoped(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Execution, "missing");
    assert!(store.get(&key).await?.is_none(), "get on missing key should return None");
    assert!(store.get_versioned(&key).await?.is_none());
    Ok(())
}

async fn test_set_and_get(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Execution, "set-get");
    store.set(&key, "hello", None).await?;
    assert_eq!(store.get(&key).await?.as_deref(), Some("hello"));
    Ok(())
}

async fn test_check_and_set_new(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::ActiveTarget, "claim-new");
    let created = store.check_and_set(&key, "exec-1", None).await?;
    assert!(created, "check_and_set on new key should return true");
    assert_eq!(store.get(&key).await?.as_deref(), Some("exec-1"));
    Ok(())
}

async fn test_check_and_set_existing(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::ActiveTarget, "claim-existing");
    store.set(&key, "exec-1", None).await?;
    let created = store.check_and_set(&key, "exec-2", None).await?;
    assert!(!created, "check_and_set on existing key should return false");
    assert_eq!(
        store.get(&key).await?.as_deref(),
        Some("exec-1"),
        "original value should remain"
    );
    Ok(())
}

async fn test_delete(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Execution, "to-delete");
    store.set(&key, "bye", None).await?;
    assert!(store.delete(&key).await?, "delete should return true for existing key");
    assert!(store.get(&key).await?.is_none(), "get after delete should return None");
    assert!(!store.delete(&key).await?, "delete on missing key should return false");
    Ok(())
}

async fn test_versions_increase(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Approval, "versions");
    store.set(&key, "v1", None).await?;
    let first = store
        .get_versioned(&key)
        .await?
        .ok_or_else(|| StateError::NotFound(key.canonical()))?;
    assert_eq!(first.version, 1, "first write should be version 1");

    store.set(&key, "v2", None).await?;
    let second = store
        .get_versioned(&key)
        .await?
        .ok_or_else(|| StateError::NotFound(key.canonical()))?;
    assert_eq!(second.value, "v2");
    assert!(second.version > first.version, "every write should bump the version");
    Ok(())
}

async fn test_compare_and_swap(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Execution, "cas-version");
    store.set(&key, "initial", None).await?;

    let result = store.compare_and_swap(&key, 999, "updated", None).await?;
    assert!(
        matches!(result, CasResult::Conflict { current_version: 1, .. }),
        "CAS with wrong version should conflict"
    );

    let result = store.compare_and_swap(&key, 1, "updated", None).await?;
    assert_eq!(result, CasResult::Ok, "CAS with correct version should succeed");
    assert_eq!(store.get(&key).await?.as_deref(), Some("updated"));

    // The old version is now stale.
    let result = store.compare_and_swap(&key, 1, "again", None).await?;
    assert!(matches!(result, CasResult::Conflict { .. }));
    Ok(())
}

async fn test_compare_and_swap_missing(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Execution, "cas-missing");
    let result = store.compare_and_swap(&key, 1, "value", None).await?;
    assert!(
        matches!(
            result,
            CasResult::Conflict {
                current_value: None,
                current_version: 0
            }
        ),
        "CAS on missing key with non-zero version should conflict"
    );

    let result = store.compare_and_swap(&key, 0, "created", None).await?;
    assert_eq!(result, CasResult::Ok, "version 0 means create");
    assert_eq!(store.get(&key).await?.as_deref(), Some("created"));
    Ok(())
}

async fn test_ttl_set(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Lock, "ttl-test");
    store
        .set(&key, "ephemeral", Some(Duration::from_secs(3600)))
        .await?;
    assert_eq!(store.get(&key).await?.as_deref(), Some("ephemeral"));
    Ok(())
}

async fn test_scan_is_scoped(store: &dyn StateStore) -> Result<(), StateError> {
    store
        .set(&StateKey::new("scan-a", KeyKind::Execution, "1"), "a1", None)
        .await?;
    store
        .set(&StateKey::new("scan-a", KeyKind::Execution, "2"), "a2", None)
        .await?;
    store
        .set(&StateKey::new("scan-a", KeyKind::Approval, "1"), "other-kind", None)
        .await?;
    store
        .set(&StateKey::new("scan-b", KeyKind::Execution, "1"), "other-org", None)
        .await?;

    let mut values: Vec<String> = store
        .scan_keys("scan-a", KeyKind::Execution)
        .await?
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    values.sort();
    assert_eq!(values, vec!["a1".to_owned(), "a2".to_owned()]);
    Ok(())
}

/// Run the full distributed lock conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_lock_conformance_tests(lock: &dyn DistributedLock) -> Result<(), StateError> {
    test_try_acquire_and_release(lock).await?;
    test_try_acquire_contention(lock).await?;
    test_lock_extend(lock).await?;
    Ok(())
}

async fn test_try_acquire_and_release(lock: &dyn DistributedLock) -> Result<(), StateError> {
    let guard = lock
        .try_acquire("sweep:expiry:org-1", Duration::from_secs(10))
        .await?
        .ok_or_else(|| StateError::LockContention("uncontested lock".into()))?;
    assert!(guard.is_held().await?, "lock should be held");
    guard.release().await?;

    let again = lock
        .try_acquire("sweep:expiry:org-1", Duration::from_secs(10))
        .await?;
    assert!(again.is_some(), "released lock should be acquirable");
    if let Some(guard) = again {
        guard.release().await?;
    }
    Ok(())
}

async fn test_try_acquire_contention(lock: &dyn DistributedLock) -> Result<(), StateError> {
    let held = lock
        .try_acquire("sweep:escalation:org-1", Duration::from_secs(10))
        .await?
        .ok_or_else(|| StateError::LockContention("uncontested lock".into()))?;

    let second = lock
        .try_acquire("sweep:escalation:org-1", Duration::from_secs(10))
        .await?;
    assert!(second.is_none(), "second acquire should fail while lock is held");

    held.release().await?;
    Ok(())
}

async fn test_lock_extend(lock: &dyn DistributedLock) -> Result<(), StateError> {
    let guard = lock
        .try_acquire("sweep:retry:org-1", Duration::from_secs(5))
        .await?
        .ok_or_else(|| StateError::LockContention("uncontested lock".into()))?;
    guard.extend(Duration::from_secs(10)).await?;
    assert!(guard.is_held().await?, "lock should still be held after extend");
    guard.release().await?;
    Ok(())
}

/// Run the retry-state conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_retry_conformance_tests(store: &dyn RetryStateStore) -> Result<(), StateError> {
    let org = OrganizationId::new(ORG);
    let action = ActionId::new("retry-action");

    assert!(store.get(&org, &action, "job-1").await?.is_none());

    let mut state = RetryState::new(action.clone(), "job-1");
    state.attempt_count = 2;
    state.last_attempt_at = Some(Utc::now());
    state.next_delay_ms = 20_000;
    state.errors.push("timeout".into());
    store.put(&org, &state).await?;

    let loaded = store
        .get(&org, &action, "job-1")
        .await?
        .ok_or_else(|| StateError::NotFound(state.key()))?;
    assert_eq!(loaded, state);

    // Other targets and organizations are isolated.
    assert!(store.get(&org, &action, "job-2").await?.is_none());
    assert!(
        store
            .get(&OrganizationId::new("elsewhere"), &action, "job-1")
            .await?
            .is_none()
    );

    assert!(store.clear(&org, &action, "job-1").await?);
    assert!(!store.clear(&org, &action, "job-1").await?);
    assert!(store.get(&org, &action, "job-1").await?.is_none());

    // Separators inside ids do not make distinct pairs share a record.
    let split = RetryState::new("a:b", "c");
    store.put(&org, &split).await?;
    assert!(store.get(&org, &ActionId::new("a"), "b:c").await?.is_none());
    assert!(store.get(&org, &ActionId::new("a:b"), "c").await?.is_some());
    assert!(store.clear(&org, &ActionId::new("a:b"), "c").await?);
    Ok(())
}
