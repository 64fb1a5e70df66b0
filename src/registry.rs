//! Tracks every long-lived handle the client acquires and guarantees
//! ordered, timeout-bounded, exactly-once teardown.
//!
//! Resources live in an arena of records keyed by opaque ids. A record holds
//! its cleanup action directly; liveness of the underlying handle is tracked
//! through an explicit [`Liveness`] token that the owning subsystem revokes,
//! so the registry never keeps a dead object alive and never needs
//! garbage-collector cooperation.
//!
//! Two teardown strategies exist and the caller picks one explicitly:
//! [`ResourceRegistry::shutdown_all`] for normal shutdown on the runtime, and
//! [`ResourceRegistry::shutdown_all_blocking`] for emergency contexts where
//! no runtime is available.

use crate::error::{Result, VoxError};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Max cleanups running at once during parallel bulk teardown.
const MAX_PARALLEL_CLEANUPS: usize = 10;

/// Default per-resource cleanup budget.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

/// What a resource is, for ordering purposes. Teardown walks [`KIND_ORDER`]
/// front to back: user-facing surfaces go first, raw streams last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ResourceKind {
    Display,
    Task,
    OsIntegration,
    WakeWord,
    Transport,
    AudioDevice,
    Thing,
    Stream,
    Other,
}

pub const KIND_ORDER: [ResourceKind; 9] = [
    ResourceKind::Display,
    ResourceKind::Task,
    ResourceKind::OsIntegration,
    ResourceKind::WakeWord,
    ResourceKind::Transport,
    ResourceKind::AudioDevice,
    ResourceKind::Thing,
    ResourceKind::Stream,
    ResourceKind::Other,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Active,
    Cleaning,
    Cleaned,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Explicit validity token for a registered handle. The owning subsystem
/// revokes it when the handle dies early; cleanup of a revoked resource
/// counts as already done.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Liveness(Arc::new(AtomicBool::new(true)))
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

pub type AsyncCleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
pub type SyncCleanup = Box<dyn FnOnce() -> Result<()> + Send>;

pub enum CleanupAction {
    Async(AsyncCleanup),
    Sync(SyncCleanup),
}

/// Everything needed to register one resource.
pub struct ResourceSpec {
    pub name: String,
    pub kind: ResourceKind,
    pub priority: i32,
    pub group: Option<String>,
    pub timeout: Duration,
    pub cleanup: CleanupAction,
    pub liveness: Option<Liveness>,
}

impl ResourceSpec {
    pub fn new_async<F, Fut>(name: &str, kind: ResourceKind, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        ResourceSpec {
            name: name.to_string(),
            kind,
            priority: 0,
            group: None,
            timeout: DEFAULT_CLEANUP_TIMEOUT,
            cleanup: CleanupAction::Async(Box::new(move || Box::pin(cleanup()))),
            liveness: None,
        }
    }

    pub fn new_sync<F>(name: &str, kind: ResourceKind, cleanup: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        ResourceSpec {
            name: name.to_string(),
            kind,
            priority: 0,
            group: None,
            timeout: DEFAULT_CLEANUP_TIMEOUT,
            cleanup: CleanupAction::Sync(Box::new(cleanup)),
            liveness: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = Some(liveness);
        self
    }
}

struct ResourceEntry {
    name: String,
    kind: ResourceKind,
    priority: i32,
    group: Option<String>,
    timeout: Duration,
    status: ResourceStatus,
    cleanup: Option<CleanupAction>,
    liveness: Option<Liveness>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cleaned: usize,
    pub failed: usize,
    pub forced: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.forced == 0
    }
}

pub struct ResourceRegistry {
    entries: Mutex<HashMap<ResourceId, ResourceEntry>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    limiter: Arc<Semaphore>,
    cleaned: AtomicUsize,
    failed: AtomicUsize,
}

impl ResourceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ResourceRegistry {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            limiter: Arc::new(Semaphore::new(MAX_PARALLEL_CLEANUPS)),
            cleaned: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    /// Track a resource. Once shutdown has begun, registration is refused:
    /// the returned id is valid but points at nothing.
    pub async fn register(&self, spec: ResourceSpec) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if self.shutting_down.load(Ordering::SeqCst) {
            log::warn!(
                "refusing to register resource '{}' ({}): shutdown in progress",
                spec.name,
                spec.kind
            );
            return id;
        }
        let entry = ResourceEntry {
            name: spec.name,
            kind: spec.kind,
            priority: spec.priority,
            group: spec.group,
            timeout: spec.timeout,
            status: ResourceStatus::Active,
            cleanup: Some(spec.cleanup),
            liveness: spec.liveness,
        };
        log::debug!("registered resource '{}' ({}) as {:?}", entry.name, entry.kind, id);
        self.entries.lock().await.insert(id, entry);
        id
    }

    /// Idempotent removal without running the cleanup action.
    pub async fn unregister(&self, id: ResourceId) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    pub async fn tracked_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Lifetime totals across all cleanups run by this registry.
    pub fn totals(&self) -> (usize, usize) {
        (
            self.cleaned.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
        )
    }

    /// Clean one resource. ACTIVE -> CLEANING -> CLEANED/FAILED; the record
    /// is removed either way. Failures are reported, never retried.
    pub async fn cleanup_one(&self, id: ResourceId) -> bool {
        let (name, action, timeout, liveness) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&id) else {
                return false;
            };
            if entry.status != ResourceStatus::Active {
                return false;
            }
            entry.status = ResourceStatus::Cleaning;
            (
                entry.name.clone(),
                entry.cleanup.take(),
                entry.timeout,
                entry.liveness.clone(),
            )
        };

        let ok = self.run_cleanup(&name, action, timeout, liveness).await;

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&id) {
            entry.status = if ok {
                ResourceStatus::Cleaned
            } else {
                ResourceStatus::Failed
            };
        }
        entries.remove(&id);
        drop(entries);

        if ok {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            log::debug!("cleaned resource '{name}'");
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    async fn run_cleanup(
        &self,
        name: &str,
        action: Option<CleanupAction>,
        timeout: Duration,
        liveness: Option<Liveness>,
    ) -> bool {
        if let Some(liveness) = liveness {
            if !liveness.is_alive() {
                log::debug!("resource '{name}' already gone, counting as cleaned");
                return true;
            }
        }
        let Some(action) = action else {
            return true;
        };

        let outcome: std::result::Result<Result<()>, tokio::time::error::Elapsed> = match action {
            CleanupAction::Async(cleanup) => tokio::time::timeout(timeout, cleanup()).await,
            CleanupAction::Sync(cleanup) => {
                let handle = tokio::task::spawn_blocking(cleanup);
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(join_err)) => Ok(Err(VoxError::Resource(format!(
                        "sync cleanup aborted: {join_err}"
                    )))),
                    Err(elapsed) => Err(elapsed),
                }
            }
        };

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("cleanup of resource '{name}' failed: {e}");
                false
            }
            Err(_) => {
                log::error!("cleanup of resource '{name}' timed out after {timeout:?}");
                false
            }
        }
    }

    /// Bulk-clean all active resources of one kind, highest priority first.
    pub async fn cleanup_by_kind(
        self: &Arc<Self>,
        kind: ResourceKind,
        parallel: bool,
    ) -> (usize, usize) {
        let ids = self
            .collect_ids(|entry| entry.kind == kind && entry.status == ResourceStatus::Active)
            .await;
        self.cleanup_ids(ids, parallel).await
    }

    /// Bulk-clean all active resources in one group, highest priority first.
    pub async fn cleanup_group(self: &Arc<Self>, group: &str, parallel: bool) -> (usize, usize) {
        let ids = self
            .collect_ids(|entry| {
                entry.group.as_deref() == Some(group) && entry.status == ResourceStatus::Active
            })
            .await;
        self.cleanup_ids(ids, parallel).await
    }

    async fn collect_ids<F>(&self, keep: F) -> Vec<(ResourceId, i32)>
    where
        F: Fn(&ResourceEntry) -> bool,
    {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| keep(entry))
            .map(|(id, entry)| (*id, entry.priority))
            .collect()
    }

    async fn cleanup_ids(
        self: &Arc<Self>,
        mut ids: Vec<(ResourceId, i32)>,
        parallel: bool,
    ) -> (usize, usize) {
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        let mut ok = 0;
        let mut bad = 0;

        if parallel && ids.len() > 1 {
            let mut set = JoinSet::new();
            for (id, _) in ids {
                let registry = Arc::clone(self);
                let limiter = Arc::clone(&self.limiter);
                set.spawn(async move {
                    let _permit = limiter.acquire_owned().await;
                    registry.cleanup_one(id).await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(true) => ok += 1,
                    Ok(false) => bad += 1,
                    Err(e) => {
                        log::error!("cleanup task did not complete: {e}");
                        bad += 1;
                    }
                }
            }
        } else {
            for (id, _) in ids {
                if self.cleanup_one(id).await {
                    ok += 1;
                } else {
                    bad += 1;
                }
            }
        }
        (ok, bad)
    }

    /// Normal shutdown strategy: walk the fixed kind order under one global
    /// deadline, then sweep stragglers, then force-clear whatever is left so
    /// the tracked count always ends at zero.
    pub async fn shutdown_all(
        self: &Arc<Self>,
        timeout: Duration,
        parallel: bool,
    ) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for kind in KIND_ORDER {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                log::warn!("shutdown deadline reached before kind {kind}");
                break;
            }
            match tokio::time::timeout(remaining, self.cleanup_by_kind(kind, parallel)).await {
                Ok((ok, bad)) => {
                    report.cleaned += ok;
                    report.failed += bad;
                }
                Err(_) => {
                    log::warn!("shutdown deadline expired while cleaning kind {kind}");
                    break;
                }
            }
        }

        // Anything registered without a kind match above, or added mid-walk.
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !remaining.is_zero() {
            let leftovers = self
                .collect_ids(|entry| entry.status == ResourceStatus::Active)
                .await;
            if !leftovers.is_empty() {
                if let Ok((ok, bad)) =
                    tokio::time::timeout(remaining, self.cleanup_ids(leftovers, parallel)).await
                {
                    report.cleaned += ok;
                    report.failed += bad;
                }
            }
        }

        let mut entries = self.entries.lock().await;
        report.forced = entries.len();
        for (_, entry) in entries.drain() {
            log::error!(
                "force-dropping resource '{}' ({}) after shutdown deadline",
                entry.name,
                entry.kind
            );
        }
        drop(entries);

        log::info!(
            "resource shutdown complete: {} cleaned, {} failed, {} forced",
            report.cleaned,
            report.failed,
            report.forced
        );
        report
    }

    /// Emergency shutdown strategy for contexts with no async runtime (signal
    /// handlers, post-runtime exit). Runs only synchronous cleanup actions in
    /// kind order. A resource that declared only an async cleanup is a leak
    /// here: it is logged as an error and counted as failed, never silently
    /// skipped.
    ///
    /// Must not be called from inside the async runtime.
    pub fn shutdown_all_blocking(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut entries = self.entries.blocking_lock();
        let mut report = ShutdownReport::default();

        for kind in KIND_ORDER {
            let mut ids: Vec<(ResourceId, i32)> = entries
                .iter()
                .filter(|(_, entry)| entry.kind == kind)
                .map(|(id, entry)| (*id, entry.priority))
                .collect();
            ids.sort_by(|a, b| b.1.cmp(&a.1));

            for (id, _) in ids {
                let Some(mut entry) = entries.remove(&id) else {
                    continue;
                };
                if let Some(liveness) = &entry.liveness {
                    if !liveness.is_alive() {
                        report.cleaned += 1;
                        continue;
                    }
                }
                match entry.cleanup.take() {
                    Some(CleanupAction::Sync(cleanup)) => match cleanup() {
                        Ok(()) => report.cleaned += 1,
                        Err(e) => {
                            log::error!("emergency cleanup of '{}' failed: {e}", entry.name);
                            report.failed += 1;
                        }
                    },
                    Some(CleanupAction::Async(_)) => {
                        log::error!(
                            "resource '{}' has no synchronous cleanup; leaked under emergency shutdown",
                            entry.name
                        );
                        report.failed += 1;
                    }
                    None => report.cleaned += 1,
                }
            }
        }

        report.forced = entries.len();
        entries.clear();
        log::info!(
            "emergency resource shutdown: {} cleaned, {} failed, {} forced",
            report.cleaned,
            report.failed,
            report.forced
        );
        report
    }

    /// Restore a pristine registry. Test seam only.
    pub async fn reset_for_tests(&self) {
        self.entries.lock().await.clear();
        self.shutting_down.store(false, Ordering::SeqCst);
        self.cleaned.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
    }
}
