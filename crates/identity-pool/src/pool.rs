//! Session pool: identity bookkeeping and the acquire/release/evict protocol
//!
//! One `tokio::sync::Mutex<PoolState>` guards the used-identity set, the live
//! map, the cached reserve and every cache write. `acquire_fresh` holds it
//! from the duplicate check through validation to the claim, so two workers
//! can never both claim an exit that a rotation happened to hand out twice.
//!
//! The work queue has its own lock. Lock order is always state, then queue.
//!
//! Entry lifecycle:
//! 1. Loaded from the cache and revalidated → reserve
//! 2. Created by the factory and validated → handed to the caller
//! 3. `prepare` moves reserve entries, then fresh ones, into the queue;
//!    reserve entries it does not need are closed
//! 4. `acquire_next` pops the queue, falling back to `acquire_fresh`
//! 5. `release` puts a healthy entry back at the tail of the queue
//! 6. `evict` drops the session and forgets the identity

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheRecord, IdentityCache};
use crate::classify::FailureKind;
use crate::error::{Error, IdentityError, Result};
use crate::factory::IdentityFactory;
use crate::identity::{Identity, PoolEntry, Tag};
use crate::queue::WorkQueue;
use crate::report::{PoolEvent, RejectReason, Reporter};
use crate::validator::Validator;

/// Attempt ceiling for a single `acquire_fresh` call.
pub const DEFAULT_MAX_FRESH_ATTEMPTS: u32 = 10;

/// Pause between `acquire_fresh` attempts.
pub const DEFAULT_FRESH_BACKOFF: Duration = Duration::from_secs(2);

/// `prepare` spends at most this many `acquire_fresh` calls per missing entry.
const PREPARE_ATTEMPTS_PER_ENTRY: usize = 3;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_fresh_attempts: u32,
    pub fresh_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_fresh_attempts: DEFAULT_MAX_FRESH_ATTEMPTS,
            fresh_backoff: DEFAULT_FRESH_BACKOFF,
        }
    }
}

/// Bookkeeping guarded by the pool lock.
///
/// Invariants: every `live` key is in `used`; every reserve entry is live.
#[derive(Default)]
struct PoolState {
    used: HashSet<Identity>,
    live: HashMap<Identity, Tag>,
    reserve: VecDeque<PoolEntry>,
}

impl PoolState {
    fn claim(&mut self, identity: &Identity, tag: Tag) {
        self.used.insert(identity.clone());
        self.live.insert(identity.clone(), tag);
    }

    fn forget(&mut self, identity: &Identity) {
        self.used.remove(identity);
        self.live.remove(identity);
    }
}

/// The identity/session pool shared by all dispatch workers.
pub struct SessionPool {
    state: Mutex<PoolState>,
    queue: WorkQueue,
    factory: IdentityFactory,
    validator: Validator,
    cache: IdentityCache,
    settings: PoolSettings,
    reporter: Arc<dyn Reporter>,
}

impl SessionPool {
    /// Load the cache and revalidate every cached identity.
    ///
    /// An unreadable cache is reported and treated as empty.
    pub async fn open(
        factory: IdentityFactory,
        validator: Validator,
        cache: IdentityCache,
        settings: PoolSettings,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let record = match cache.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "identity cache unreadable, starting empty");
                reporter.report(&PoolEvent::CacheUnavailable {
                    error: e.to_string(),
                });
                CacheRecord::default()
            }
        };
        let cached = record.cached_identities();
        let used = record.used_identities();
        reporter.report(&PoolEvent::CacheLoaded {
            cached: cached.len(),
            used: used.len(),
        });

        let pool = Self {
            state: Mutex::new(PoolState {
                used,
                ..PoolState::default()
            }),
            queue: WorkQueue::new(),
            factory,
            validator,
            cache,
            settings,
            reporter,
        };
        pool.fill_from_cache(cached).await;
        pool
    }

    /// Rebuild and validate a session for each cached identity.
    ///
    /// Survivors go to the reserve; the rest are forgotten entirely. An
    /// identity the pool already holds live is left alone.
    async fn fill_from_cache(&self, cached: Vec<(Identity, Tag)>) {
        let mut state = self.state.lock().await;
        for (identity, tag) in cached {
            if state.live.contains_key(&identity) {
                warn!(identity = %identity, "cached identity already live, skipping");
                continue;
            }
            let session = match self.factory.build_session() {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "could not rebuild cached session");
                    None
                }
            };
            let valid = match &session {
                Some(session) => self.validator.validate(session.as_ref()).await,
                None => false,
            };
            match session {
                Some(session) if valid => {
                    state.claim(&identity, tag);
                    self.reporter.report(&PoolEvent::CachedIdentityRestored {
                        identity: identity.clone(),
                        tag,
                    });
                    state.reserve.push_back(PoolEntry::new(identity, tag, session));
                }
                _ => {
                    state.forget(&identity);
                    self.reporter
                        .report(&PoolEvent::CachedIdentityPruned { identity });
                }
            }
        }
        info!(restored = state.reserve.len(), "cached sessions revalidated");
        self.persist(&state).await;
    }

    /// Fill the work queue with `n` ready entries.
    ///
    /// Cached entries go first. Cached entries beyond `n` are closed and
    /// forgotten, so the cache afterwards names only what was queued. Any
    /// shortfall is covered by `acquire_fresh`, bounded at three calls per
    /// missing entry. Falling short is reported, not fatal: dispatch
    /// acquires on demand. Returns the number queued.
    pub async fn prepare(&self, n: usize) -> usize {
        let mut prepared = 0usize;
        {
            let mut state = self.state.lock().await;
            while prepared < n {
                let Some(entry) = state.reserve.pop_front() else {
                    break;
                };
                let (identity, tag) = (entry.identity().clone(), entry.tag());
                match self.queue.push(entry).await {
                    Ok(()) => {
                        prepared += 1;
                        self.reporter.report(&PoolEvent::EntryQueued {
                            identity,
                            tag,
                            queued: prepared,
                            requested: n,
                        });
                    }
                    Err(duplicate) => {
                        warn!(identity = %identity, "cached identity already queued");
                        duplicate.close();
                    }
                }
            }

            if !state.reserve.is_empty() {
                let surplus: Vec<PoolEntry> = state.reserve.drain(..).collect();
                info!(released = surplus.len(), "releasing surplus cached sessions");
                for entry in surplus {
                    let identity = entry.close();
                    state.forget(&identity);
                }
                self.persist(&state).await;
            }
        }

        let shortfall = n - prepared;
        if shortfall > 0 {
            info!(
                needed = shortfall,
                cached = prepared,
                "acquiring fresh identities"
            );
        }
        let max_calls = shortfall * PREPARE_ATTEMPTS_PER_ENTRY;
        let mut calls = 0usize;
        while prepared < n && calls < max_calls {
            calls += 1;
            let entry = match self.acquire_fresh().await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, call = calls, "fresh identity unavailable");
                    continue;
                }
            };
            let (identity, tag) = (entry.identity().clone(), entry.tag());
            match self.queue.push(entry).await {
                Ok(()) => {
                    prepared += 1;
                    self.reporter.report(&PoolEvent::EntryQueued {
                        identity,
                        tag,
                        queued: prepared,
                        requested: n,
                    });
                }
                Err(duplicate) => {
                    warn!(identity = %identity, "fresh identity already queued");
                    duplicate.close();
                }
            }
        }

        if prepared < n {
            self.reporter.report(&PoolEvent::PrepareShortfall {
                prepared,
                requested: n,
            });
        }
        prepared
    }

    /// Rotate until a new, unclaimed, validated identity turns up.
    ///
    /// Every attempt forces a circuit rotation. Control failures, probe
    /// failures, duplicates and validation failures each consume one attempt.
    pub async fn acquire_fresh(&self) -> Result<PoolEntry> {
        let max = self.settings.max_fresh_attempts;
        for attempt in 1..=max {
            if attempt > 1 && !self.settings.fresh_backoff.is_zero() {
                tokio::time::sleep(self.settings.fresh_backoff).await;
            }

            let entry = match self.factory.new_identity().await {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(attempt, error = %e, "identity attempt failed");
                    self.reporter.report(&PoolEvent::IdentityRejected {
                        identity: None,
                        attempt,
                        reason: reject_reason(&e),
                    });
                    continue;
                }
            };

            let mut state = self.state.lock().await;
            if state.used.contains(entry.identity()) || self.queue.contains(entry.identity()).await
            {
                self.reporter.report(&PoolEvent::IdentityRejected {
                    identity: Some(entry.identity().clone()),
                    attempt,
                    reason: RejectReason::Duplicate,
                });
                entry.close();
                continue;
            }
            if !self.validator.validate(entry.session()).await {
                self.reporter.report(&PoolEvent::IdentityRejected {
                    identity: Some(entry.identity().clone()),
                    attempt,
                    reason: RejectReason::Validation,
                });
                entry.close();
                continue;
            }

            state.claim(entry.identity(), entry.tag());
            self.persist(&state).await;
            self.reporter.report(&PoolEvent::IdentityAcquired {
                identity: entry.identity().clone(),
                tag: entry.tag(),
                attempt,
            });
            return Ok(entry);
        }

        Err(Error::PoolExhausted(format!(
            "no usable identity after {max} attempts"
        )))
    }

    /// Next ready entry: the queue head, or a fresh identity if the queue is empty.
    pub async fn acquire_next(&self) -> Result<PoolEntry> {
        if let Some(entry) = self.queue.pop().await {
            let mut state = self.state.lock().await;
            state.claim(entry.identity(), entry.tag());
            self.persist(&state).await;
            debug!(identity = %entry.identity(), "checked out queued entry");
            return Ok(entry);
        }
        debug!("work queue empty, acquiring fresh identity");
        self.acquire_fresh().await
    }

    /// Return a healthy entry for reuse.
    pub async fn release(&self, entry: PoolEntry) {
        {
            let mut state = self.state.lock().await;
            state.claim(entry.identity(), entry.tag());
            self.persist(&state).await;
        }
        debug!(identity = %entry.identity(), "released entry");
        if let Err(duplicate) = self.queue.push(entry).await {
            warn!(identity = %duplicate.identity(), "released entry was already queued");
            duplicate.close();
        }
    }

    /// Close a checked-out entry's session and forget its identity.
    pub async fn evict(&self, entry: PoolEntry, reason: FailureKind) {
        let identity = entry.close();
        self.evict_identity(&identity, reason).await;
    }

    /// Forget an identity wherever it is held by the pool.
    ///
    /// A queued or reserved entry for it is closed too. The identity may be
    /// claimed again if the network later hands out the same exit.
    pub async fn evict_identity(&self, identity: &Identity, reason: FailureKind) {
        let mut state = self.state.lock().await;
        state.forget(identity);
        if let Some(position) = state.reserve.iter().position(|e| e.identity() == identity) {
            if let Some(entry) = state.reserve.remove(position) {
                entry.close();
            }
        }
        if let Some(entry) = self.queue.remove(identity).await {
            entry.close();
        }
        self.persist(&state).await;
        info!(identity = %identity, reason = reason.label(), "identity evicted");
        self.reporter.report(&PoolEvent::IdentityEvicted {
            identity: identity.clone(),
            reason,
        });
    }

    /// Identities claimed and not evicted.
    pub async fn used_identities(&self) -> HashSet<Identity> {
        self.state.lock().await.used.clone()
    }

    /// Live identity → tag bindings.
    pub async fn live_identities(&self) -> HashMap<Identity, Tag> {
        self.state.lock().await.live.clone()
    }

    /// Queued identities, oldest first.
    pub async fn queued_identities(&self) -> Vec<Identity> {
        self.queue.identities().await
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Pool summary with per-identity state.
    ///
    /// Entries are `queued`, `reserve` (cached, not yet queued) or
    /// `checked_out` (held by a worker).
    pub async fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let queued: HashSet<Identity> = self.queue.identities().await.into_iter().collect();
        let reserve: HashSet<&Identity> = state.reserve.iter().map(|e| e.identity()).collect();

        let mut live: Vec<(&Identity, &Tag)> = state.live.iter().collect();
        live.sort();
        let entries: Vec<serde_json::Value> = live
            .into_iter()
            .map(|(identity, tag)| {
                let status = if queued.contains(identity) {
                    "queued"
                } else if reserve.contains(identity) {
                    "reserve"
                } else {
                    "checked_out"
                };
                serde_json::json!({
                    "identity": identity,
                    "tag": tag,
                    "status": status,
                })
            })
            .collect();

        serde_json::json!({
            "identities_used": state.used.len(),
            "identities_live": state.live.len(),
            "queued": queued.len(),
            "reserve": reserve.len(),
            "entries": entries,
        })
    }

    /// Rewrite the cache from the current bookkeeping. Failures are reported
    /// and swallowed: losing a cache write never stops a run.
    async fn persist(&self, state: &PoolState) {
        let record = CacheRecord::from_state(&state.used, &state.live);
        if let Err(e) = self.cache.save(&record).await {
            warn!(error = %e, path = %self.cache.path().display(), "failed to persist identity cache");
            self.reporter.report(&PoolEvent::CacheWriteFailed {
                error: e.to_string(),
            });
        }
    }
}

fn reject_reason(error: &IdentityError) -> RejectReason {
    match error {
        IdentityError::ControlChannel(_) => RejectReason::ControlChannel,
        IdentityError::SessionBuild(_) => RejectReason::SessionBuild,
        IdentityError::ExitProbe(_) => RejectReason::ExitProbe,
    }
}
