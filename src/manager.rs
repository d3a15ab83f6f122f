//! Lease-based file locks over the shared registry.
//!
//! Every operation is one [`RegistryStore::with_lock`] transaction: the
//! registry is loaded fresh, inspected, mutated and saved while the
//! cross-process mutex is held, so two instances can never both observe a
//! path as free and both take it.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::fingerprint;
use crate::identity::Identity;
use crate::model::{
    AcquireOutcome, ConflictStatus, Instance, Lock, LockHolder, PruneReport, WorkRegistry,
};
use crate::paths;
use crate::store::registry::RegistryStore;

pub struct LockManager {
    store: RegistryStore,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: RegistryStore, config: Config) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The active lock on `file_path`, if any. Expired locks read as free
    /// even before they are physically removed.
    pub fn check_lock(&self, file_path: &Path) -> Result<Option<LockHolder>> {
        let key = paths::key(file_path);
        let now = self.now();
        self.store
            .with_lock(|reg| Ok(reg.active_lock(&key, now).map(|l| reg.holder(l))))
    }

    /// Take, renew or reclaim the lease on `file_path` for `instance_id`.
    ///
    /// - no lock, or an expired one, or one already held by the caller: write
    ///   a fresh lease and succeed
    /// - an active lock held by someone else: `LockedByOther`, nothing written
    pub fn acquire_lock(
        &self,
        file_path: &Path,
        instance_id: &str,
        intent: &str,
    ) -> Result<AcquireOutcome> {
        let key = paths::key(file_path);
        let now = self.now();
        let ttl = self.config.lease_ttl();
        let max_age = self.config.instance_max_age();

        let outcome = self.store.with_lock(|reg| {
            let outcome = match reg.locks.get(&key) {
                None => AcquireOutcome::Acquired,
                Some(existing) if existing.holder_instance_id == instance_id => {
                    AcquireOutcome::Renewed
                }
                Some(existing) if existing.is_expired(now) => AcquireOutcome::Reclaimed {
                    previous_holder: existing.holder_instance_id.clone(),
                },
                Some(existing) => {
                    return Ok(AcquireOutcome::LockedByOther {
                        holder: reg.holder(existing),
                    });
                }
            };

            // Renewal never shortens a lease, even if the clock stepped back.
            let expires_at = match (&outcome, reg.locks.get(&key)) {
                (AcquireOutcome::Renewed, Some(existing)) => (now + ttl).max(existing.expires_at),
                _ => now + ttl,
            };
            let acquired_at = match (&outcome, reg.locks.get(&key)) {
                (AcquireOutcome::Renewed, Some(existing)) if existing.is_active(now) => {
                    existing.acquired_at
                }
                _ => now,
            };

            reg.locks.insert(
                key.clone(),
                Lock {
                    file_path: key.clone(),
                    holder_instance_id: instance_id.to_string(),
                    intent: intent.to_string(),
                    acquired_at,
                    expires_at,
                    content_fingerprint: fingerprint::of_file(file_path)?,
                },
            );
            reg.touch_instance(instance_id, now);
            prune_expired_locks(reg, now);
            prune_stale_instances(reg, now, max_age);
            Ok(outcome)
        })?;

        match &outcome {
            AcquireOutcome::Reclaimed { previous_holder } => {
                info!(path = %key, instance_id, previous_holder, "reclaimed expired lock");
            }
            AcquireOutcome::LockedByOther { holder } => {
                debug!(path = %key, instance_id, holder = holder.instance_id(), "lock held by other");
            }
            _ => debug!(path = %key, instance_id, ?outcome, "lock granted"),
        }
        Ok(outcome)
    }

    /// Drop the lock on `file_path` if `instance_id` holds it. Returns whether
    /// anything was removed; a missing or foreign lock is a no-op.
    pub fn release_lock(&self, file_path: &Path, instance_id: &str) -> Result<bool> {
        let key = paths::key(file_path);
        let now = self.now();
        let released = self.store.with_lock(|reg| {
            let held = reg
                .locks
                .get(&key)
                .is_some_and(|l| l.holder_instance_id == instance_id);
            if held {
                reg.locks.remove(&key);
                reg.touch_instance(instance_id, now);
            }
            Ok(held)
        })?;
        if !released {
            debug!(path = %key, instance_id, "release ignored: not the holder");
        }
        Ok(released)
    }

    /// Compare the file's current content with the fingerprint stored on its
    /// active lock. Advisory: callers surface `Changed` as a warning only.
    pub fn detect_conflict(&self, file_path: &Path) -> Result<ConflictStatus> {
        let key = paths::key(file_path);
        let now = self.now();
        let expected = self.store.with_lock(|reg| {
            Ok(reg
                .active_lock(&key, now)
                .map(|l| l.content_fingerprint.clone()))
        })?;
        compare_fingerprint(file_path, &key, expected)
    }

    /// Like [`LockManager::detect_conflict`], but against `instance_id`'s own
    /// lock entry even after its lease lapsed, so edits made in the gap are
    /// still caught. `Unlocked` when the entry is missing or someone else's.
    pub fn detect_own_conflict(
        &self,
        file_path: &Path,
        instance_id: &str,
    ) -> Result<ConflictStatus> {
        let key = paths::key(file_path);
        let expected = self.store.with_lock(|reg| {
            Ok(reg
                .locks
                .get(&key)
                .filter(|l| l.holder_instance_id == instance_id)
                .map(|l| l.content_fingerprint.clone()))
        })?;
        compare_fingerprint(file_path, &key, expected)
    }

    /// After the holder's own write, record the file's new content so later
    /// checks only flag changes made by someone else.
    pub fn sync_fingerprint(&self, file_path: &Path, instance_id: &str) -> Result<bool> {
        let key = paths::key(file_path);
        let now = self.now();
        let current = fingerprint::of_file(file_path)?;
        self.store.with_lock(|reg| {
            let Some(lock) = reg.locks.get_mut(&key) else {
                return Ok(false);
            };
            if lock.holder_instance_id != instance_id || lock.is_expired(now) {
                return Ok(false);
            }
            lock.content_fingerprint = current;
            reg.touch_instance(instance_id, now);
            Ok(true)
        })
    }

    /// Upsert the instance record with the identity's metadata.
    pub fn register_instance(&self, identity: &Identity) -> Result<()> {
        let now = self.now();
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string());
        self.store.with_lock(|reg| {
            let entry = reg
                .instances
                .entry(identity.id.clone())
                .or_insert_with(|| Instance::bare(&identity.id, now));
            entry.branch = identity.branch.clone();
            entry.task = identity.task.clone();
            entry.cwd = cwd;
            entry.pid = Some(std::process::id());
            entry.last_heartbeat = now;
            Ok(())
        })
    }

    /// Release every lock `instance_id` holds. Returns the released paths.
    pub fn release_all(&self, instance_id: &str) -> Result<Vec<String>> {
        let now = self.now();
        let released = self.store.with_lock(|reg| {
            let mine: Vec<String> = reg
                .locks
                .iter()
                .filter(|(_, l)| l.holder_instance_id == instance_id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &mine {
                reg.locks.remove(key);
            }
            if reg.instances.contains_key(instance_id) {
                reg.touch_instance(instance_id, now);
            }
            Ok(mine)
        })?;
        if !released.is_empty() {
            info!(instance_id, count = released.len(), "released all locks");
        }
        Ok(released)
    }

    /// Physically remove expired locks and long-silent instances.
    pub fn prune(&self) -> Result<PruneReport> {
        let now = self.now();
        let max_age = self.config.instance_max_age();
        self.store.with_lock(|reg| {
            let expired_locks = prune_expired_locks(reg, now);
            let stale_instances = prune_stale_instances(reg, now, max_age);
            Ok(PruneReport {
                expired_locks,
                stale_instances,
            })
        })
    }

    /// All active locks, ordered by path.
    pub fn list_locks(&self) -> Result<Vec<LockHolder>> {
        let now = self.now();
        self.store.with_lock(|reg| {
            Ok(reg
                .locks
                .values()
                .filter(|l| l.is_active(now))
                .map(|l| reg.holder(l))
                .collect())
        })
    }

    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        self.store
            .with_lock(|reg| Ok(reg.instances.values().cloned().collect()))
    }
}

/// `expected` is the fingerprint recorded on the lock, `None` for no lock.
fn compare_fingerprint(
    file_path: &Path,
    key: &str,
    expected: Option<Option<String>>,
) -> Result<ConflictStatus> {
    let Some(expected) = expected else {
        return Ok(ConflictStatus::Unlocked);
    };
    let actual = fingerprint::of_file(file_path)?;
    if actual == expected {
        Ok(ConflictStatus::Clean)
    } else {
        warn!(path = %key, "file changed since lock was taken");
        Ok(ConflictStatus::Changed { expected, actual })
    }
}

/// Physically remove expired locks. Returns their paths.
fn prune_expired_locks(reg: &mut WorkRegistry, now: DateTime<Utc>) -> Vec<String> {
    let expired: Vec<String> = reg
        .locks
        .iter()
        .filter(|(_, l)| l.is_expired(now))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        reg.locks.remove(key);
    }
    expired
}

/// Drop instances whose heartbeat is older than `max_age` and that hold no
/// active lock. Returns the removed ids.
fn prune_stale_instances(
    reg: &mut WorkRegistry,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> Vec<String> {
    let cutoff = now - max_age;
    let stale: Vec<String> = reg
        .instances
        .values()
        .filter(|i| i.last_heartbeat < cutoff)
        .filter(|i| {
            !reg
                .locks
                .values()
                .any(|l| l.holder_instance_id == i.id && l.is_active(now))
        })
        .map(|i| i.id.clone())
        .collect();
    for id in &stale {
        reg.instances.remove(id);
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        clock: Arc<ManualClock>,
        manager: LockManager,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let latch_dir = root.join(".latch");
        let store = RegistryStore::open(&latch_dir, std::time::Duration::from_secs(2));
        store.ensure().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = LockManager::new(store, Config::default()).with_clock(clock.clone());
        Fixture {
            _dir: dir,
            root,
            clock,
            manager,
        }
    }

    fn file(fx: &Fixture, name: &str, content: &str) -> PathBuf {
        let path = fx.root.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn lease_timeline_deny_then_reclaim_then_stale_release_is_noop() {
        let fx = setup();
        let x = file(&fx, "x.py", "print(1)\n");

        // t=0: A acquires
        let a = fx.manager.acquire_lock(&x, "A", "Modifying file via Edit").unwrap();
        assert_eq!(a, AcquireOutcome::Acquired);

        // t=1min: B denied, holder=A
        fx.clock.advance(Duration::minutes(1));
        match fx.manager.acquire_lock(&x, "B", "edit").unwrap() {
            AcquireOutcome::LockedByOther { holder } => {
                assert_eq!(holder.instance_id(), "A");
                assert_eq!(holder.lock.intent, "Modifying file via Edit");
            }
            other => panic!("expected LockedByOther, got {other:?}"),
        }

        // t=6min: lease expired, B reclaims
        fx.clock.advance(Duration::minutes(5));
        assert_eq!(
            fx.manager.acquire_lock(&x, "B", "edit").unwrap(),
            AcquireOutcome::Reclaimed {
                previous_holder: "A".into()
            }
        );

        // A's late release does not touch B's lock
        assert!(!fx.manager.release_lock(&x, "A").unwrap());
        let holder = fx.manager.check_lock(&x).unwrap().unwrap();
        assert_eq!(holder.instance_id(), "B");
    }

    #[test]
    fn renewal_by_owner_extends_lease_monotonically() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");

        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        let mut last = fx.manager.check_lock(&x).unwrap().unwrap().lock.expires_at;
        for _ in 0..5 {
            fx.clock.advance(Duration::seconds(30));
            assert_eq!(
                fx.manager.acquire_lock(&x, "A", "edit").unwrap(),
                AcquireOutcome::Renewed
            );
            let next = fx.manager.check_lock(&x).unwrap().unwrap().lock.expires_at;
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn renewal_keeps_lease_when_clock_steps_back() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        let first = fx.manager.check_lock(&x).unwrap().unwrap().lock.expires_at;

        fx.clock.advance(Duration::seconds(-30));
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        let second = fx.manager.check_lock(&x).unwrap().unwrap().lock.expires_at;
        assert!(second >= first);
    }

    #[test]
    fn owner_renews_own_expired_lock_without_reclaim() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        fx.clock.advance(Duration::minutes(10));
        assert_eq!(
            fx.manager.acquire_lock(&x, "A", "edit").unwrap(),
            AcquireOutcome::Renewed
        );
        let lock = fx.manager.check_lock(&x).unwrap().unwrap().lock;
        assert_eq!(lock.acquired_at, fx.clock.now());
    }

    #[test]
    fn expired_lock_reads_as_unlocked() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        assert!(fx.manager.check_lock(&x).unwrap().is_some());
        fx.clock.advance(Duration::seconds(301));
        assert!(fx.manager.check_lock(&x).unwrap().is_none());
        assert!(fx.manager.list_locks().unwrap().is_empty());
    }

    #[test]
    fn release_requires_holder() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();

        assert!(!fx.manager.release_lock(&x, "B").unwrap());
        assert!(fx.manager.check_lock(&x).unwrap().is_some());

        assert!(fx.manager.release_lock(&x, "A").unwrap());
        assert!(fx.manager.check_lock(&x).unwrap().is_none());

        // Releasing again is still fine
        assert!(!fx.manager.release_lock(&x, "A").unwrap());
    }

    #[test]
    fn unknown_holder_still_blocks() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        fx.manager
            .store()
            .with_lock(|reg| {
                reg.instances.remove("A");
                Ok(())
            })
            .unwrap();

        match fx.manager.acquire_lock(&x, "B", "edit").unwrap() {
            AcquireOutcome::LockedByOther { holder } => {
                assert!(!holder.is_known());
                assert_eq!(holder.instance_id(), "A");
            }
            other => panic!("expected LockedByOther, got {other:?}"),
        }
    }

    #[test]
    fn conflict_detection_flags_out_of_band_edits() {
        let fx = setup();
        let x = file(&fx, "x.py", "v1");
        assert_eq!(
            fx.manager.detect_conflict(&x).unwrap(),
            ConflictStatus::Unlocked
        );

        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        assert_eq!(fx.manager.detect_conflict(&x).unwrap(), ConflictStatus::Clean);

        fs::write(&x, "v2 from a human").unwrap();
        let status = fx.manager.detect_conflict(&x).unwrap();
        assert!(!status.is_conflict_free());

        // Advisory: the holder can still renew
        assert_eq!(
            fx.manager.acquire_lock(&x, "A", "edit").unwrap(),
            AcquireOutcome::Renewed
        );
        assert_eq!(fx.manager.detect_conflict(&x).unwrap(), ConflictStatus::Clean);
    }

    #[test]
    fn own_conflict_survives_lapsed_lease() {
        let fx = setup();
        let x = file(&fx, "x.py", "v1");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        fx.clock.advance(Duration::minutes(10));
        fs::write(&x, "edited while the lease had lapsed").unwrap();

        assert_eq!(fx.manager.detect_conflict(&x).unwrap(), ConflictStatus::Unlocked);
        assert!(
            !fx.manager
                .detect_own_conflict(&x, "A")
                .unwrap()
                .is_conflict_free()
        );
        // Another instance has nothing of its own to compare
        assert_eq!(
            fx.manager.detect_own_conflict(&x, "B").unwrap(),
            ConflictStatus::Unlocked
        );
    }

    #[test]
    fn huge_lease_ttl_does_not_overflow() {
        let fx = setup();
        let x = file(&fx, "x.py", "a");
        let config = Config {
            lease_ttl_secs: u64::MAX,
            instance_max_age_secs: u64::MAX,
            ..Config::default()
        };
        let manager = LockManager::new(fx.manager.store().clone(), config)
            .with_clock(fx.clock.clone());

        assert_eq!(
            manager.acquire_lock(&x, "A", "edit").unwrap(),
            AcquireOutcome::Acquired
        );
        assert_eq!(
            manager.acquire_lock(&x, "A", "edit").unwrap(),
            AcquireOutcome::Renewed
        );
        let lock = manager.check_lock(&x).unwrap().unwrap().lock;
        assert!(lock.expires_at <= fx.clock.now() + Duration::days(366));
        manager.prune().unwrap();
    }

    #[test]
    fn sync_fingerprint_absorbs_holders_own_write() {
        let fx = setup();
        let x = fx.root.join("new.rs");
        fx.manager.acquire_lock(&x, "A", "create").unwrap();
        let lock = fx.manager.check_lock(&x).unwrap().unwrap().lock;
        assert_eq!(lock.content_fingerprint, None);

        fs::write(&x, "fn main() {}").unwrap();
        assert!(!fx.manager.sync_fingerprint(&x, "B").unwrap());
        assert!(!fx.manager.detect_conflict(&x).unwrap().is_conflict_free());

        assert!(fx.manager.sync_fingerprint(&x, "A").unwrap());
        assert_eq!(fx.manager.detect_conflict(&x).unwrap(), ConflictStatus::Clean);
    }

    #[test]
    fn register_instance_records_metadata() {
        let fx = setup();
        let identity = Identity {
            id: "A".into(),
            session_key: "s".into(),
            branch: Some("feature/x".into()),
            task: Some("port parser".into()),
            created_at: Utc::now(),
            ephemeral: false,
        };
        fx.manager.register_instance(&identity).unwrap();
        let instances = fx.manager.list_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].branch.as_deref(), Some("feature/x"));
        assert_eq!(instances[0].task.as_deref(), Some("port parser"));
        assert_eq!(instances[0].pid, Some(std::process::id()));
    }

    #[test]
    fn release_all_only_touches_callers_locks() {
        let fx = setup();
        let a1 = file(&fx, "a1", "");
        let a2 = file(&fx, "a2", "");
        let b1 = file(&fx, "b1", "");
        fx.manager.acquire_lock(&a1, "A", "edit").unwrap();
        fx.manager.acquire_lock(&a2, "A", "edit").unwrap();
        fx.manager.acquire_lock(&b1, "B", "edit").unwrap();

        let released = fx.manager.release_all("A").unwrap();
        assert_eq!(released.len(), 2);
        let left = fx.manager.list_locks().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id(), "B");
    }

    #[test]
    fn prune_removes_expired_locks() {
        let fx = setup();
        let x = file(&fx, "x", "");
        let y = file(&fx, "y", "");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        fx.clock.advance(Duration::minutes(4));
        fx.manager.acquire_lock(&y, "A", "edit").unwrap();
        fx.clock.advance(Duration::minutes(2));

        let report = fx.manager.prune().unwrap();
        assert_eq!(report.expired_locks, vec![paths::key(&x)]);
        assert!(report.stale_instances.is_empty());
        assert_eq!(fx.manager.list_locks().unwrap().len(), 1);
    }

    #[test]
    fn acquire_sweeps_expired_locks_and_idle_instances() {
        let fx = setup();
        let x = file(&fx, "x", "");
        let y = file(&fx, "y", "");
        fx.manager.acquire_lock(&x, "A", "edit").unwrap();
        fx.clock.advance(Duration::hours(25));
        fx.manager.acquire_lock(&y, "B", "edit").unwrap();

        let keys: Vec<String> = fx
            .manager
            .store()
            .load()
            .unwrap()
            .locks
            .into_keys()
            .collect();
        assert_eq!(keys, vec![paths::key(&y)]);

        let report = fx.manager.prune().unwrap();
        assert_eq!(report, PruneReport::default());
        let ids: Vec<String> = fx
            .manager
            .list_instances()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["B".to_string()]);
    }

    #[test]
    fn instance_with_active_lock_survives_pruning() {
        let fx = setup();
        let x = file(&fx, "x", "");
        let config = Config {
            lease_ttl_secs: 7200,
            instance_max_age_secs: 60,
            ..Config::default()
        };
        let manager = LockManager::new(fx.manager.store().clone(), config)
            .with_clock(fx.clock.clone());
        manager.acquire_lock(&x, "A", "long edit").unwrap();
        fx.clock.advance(Duration::minutes(30));

        let report = manager.prune().unwrap();
        assert!(report.stale_instances.is_empty());
        assert!(report.expired_locks.is_empty());
    }
}
