//! Request dispatch
//!
//! `handle_event` is a pure per-request state machine: it receives events and
//! returns (new_state, action). `Dispatcher` executes the I/O implied by each
//! action against the pool and the checked-out session.
//!
//! ```text
//! Acquire --acquired--> Send(1) --success--> Done
//!                         |
//!                         +--retryable, attempt < max--> Replace(n) --acquired--> Send(n+1)
//!                         +--retryable, attempt = max--> Failed
//! Acquire/Replace --acquire failed--> Failed(pool_exhausted)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info_span, warn};
use transport::TransportError;

use crate::classify::{AttemptResult, FailureKind, classify_send};
use crate::error::Result;
use crate::identity::PoolEntry;
use crate::pool::SessionPool;
use crate::report::{PoolEvent, Reporter};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Per-request states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the first session
    Acquire,
    /// Sending attempt `attempt` (1-based)
    Send { attempt: u32 },
    /// Attempt `attempt` failed; waiting for a replacement identity
    Replace { attempt: u32 },
    /// Terminal: the target answered with a non-retryable status
    Done { status: u16, bytes: usize, attempts: u32 },
    /// Terminal: retries exhausted or no identity available
    Failed { reason: FailureKind, attempts: u32 },
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done { .. } | RequestState::Failed { .. })
    }
}

/// Events that drive request transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    /// The pool handed out an entry
    SessionAcquired,
    /// The pool could not produce an entry
    AcquireFailed,
    /// A send finished
    Sent(AttemptResult),
}

/// Actions the dispatcher executes after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Send over the held entry
    Send { attempt: u32 },
    /// Return the held entry to the pool
    Release,
    /// Evict the held entry and acquire a fresh identity
    EvictAndReplace {
        reason: FailureKind,
        attempt: u32,
        status: Option<u16>,
    },
    /// Evict the held entry; the request is over
    Evict { reason: FailureKind },
    /// No-op
    None,
}

/// Handle a request transition. Pure function: no I/O.
pub fn handle_event(
    state: RequestState,
    event: RequestEvent,
    max_attempts: u32,
) -> (RequestState, RequestAction) {
    match (state, event) {
        // --- Acquire ---
        (RequestState::Acquire, RequestEvent::SessionAcquired) => (
            RequestState::Send { attempt: 1 },
            RequestAction::Send { attempt: 1 },
        ),
        (RequestState::Acquire, RequestEvent::AcquireFailed) => (
            RequestState::Failed {
                reason: FailureKind::PoolExhausted,
                attempts: 0,
            },
            RequestAction::None,
        ),

        // --- Send ---
        (RequestState::Send { attempt }, RequestEvent::Sent(AttemptResult::Success { status, bytes })) => (
            RequestState::Done {
                status,
                bytes,
                attempts: attempt,
            },
            RequestAction::Release,
        ),
        (RequestState::Send { attempt }, RequestEvent::Sent(AttemptResult::Retry { kind, status }))
            if attempt < max_attempts =>
        {
            (
                RequestState::Replace { attempt },
                RequestAction::EvictAndReplace {
                    reason: kind,
                    attempt,
                    status,
                },
            )
        }
        (RequestState::Send { attempt }, RequestEvent::Sent(AttemptResult::Retry { kind, .. })) => (
            RequestState::Failed {
                reason: kind,
                attempts: attempt,
            },
            RequestAction::Evict { reason: kind },
        ),

        // --- Replace ---
        (RequestState::Replace { attempt }, RequestEvent::SessionAcquired) => (
            RequestState::Send {
                attempt: attempt + 1,
            },
            RequestAction::Send {
                attempt: attempt + 1,
            },
        ),
        (RequestState::Replace { attempt }, RequestEvent::AcquireFailed) => (
            RequestState::Failed {
                reason: FailureKind::PoolExhausted,
                attempts: attempt,
            },
            RequestAction::None,
        ),

        // Ignore unexpected events
        (state, _) => (state, RequestAction::None),
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub request_timeout: Duration,
    /// Sends per request, including the first
    pub max_attempts: u32,
    pub max_workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Terminal result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestResult {
    Done { status: u16, bytes: usize, attempts: u32 },
    Failed { reason: FailureKind, attempts: u32 },
}

impl RequestResult {
    pub fn is_done(&self) -> bool {
        matches!(self, RequestResult::Done { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// 1-based request number
    pub request: usize,
    /// 1-based worker number
    pub worker: usize,
    pub request_id: String,
    pub result: RequestResult,
}

/// Runs requests against the pool on a bounded set of workers.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<SessionPool>,
    settings: DispatchSettings,
    reporter: Arc<dyn Reporter>,
}

impl Dispatcher {
    pub fn new(pool: Arc<SessionPool>, settings: DispatchSettings, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            pool,
            settings,
            reporter,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Run `count` GETs of `url` on `min(max_workers, count)` workers.
    ///
    /// Each worker runs one request to a terminal state before claiming the
    /// next. A failed request never stops its siblings. Outcomes are returned
    /// in request order.
    pub async fn run_all(&self, url: &str, count: usize) -> Vec<RequestOutcome> {
        let workers = self.settings.max_workers.min(count);
        let next = Arc::new(AtomicUsize::new(1));
        let url: Arc<str> = Arc::from(url);

        let mut set = JoinSet::new();
        for worker in 1..=workers {
            let dispatcher = self.clone();
            let next = next.clone();
            let url = url.clone();
            set.spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let request = next.fetch_add(1, Ordering::SeqCst);
                    if request > count {
                        break;
                    }
                    outcomes.push(dispatcher.run_request(&url, request, worker).await);
                }
                outcomes
            });
        }

        let mut outcomes = Vec::with_capacity(count);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(batch) => outcomes.extend(batch),
                Err(e) => error!(error = %e, "dispatch worker panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.request);
        outcomes
    }

    /// Drive one request to a terminal state.
    pub async fn run_request(&self, url: &str, request: usize, worker: usize) -> RequestOutcome {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let span = info_span!("request", request_id = %request_id, request, worker);
        let result = self.drive(url, request, worker).instrument(span).await;
        RequestOutcome {
            request,
            worker,
            request_id,
            result,
        }
    }

    async fn drive(&self, url: &str, request: usize, worker: usize) -> RequestResult {
        let max = self.settings.max_attempts;
        let mut entry: Option<PoolEntry> = None;
        let mut state = RequestState::Acquire;
        let mut event = hold(&mut entry, self.pool.acquire_next().await);

        loop {
            let (next, action) = handle_event(state, event, max);
            state = next;
            event = match action {
                RequestAction::Send { attempt } => match entry.as_ref() {
                    Some(current) => RequestEvent::Sent(
                        self.send(url, current, request, worker, attempt).await,
                    ),
                    None => RequestEvent::AcquireFailed,
                },
                RequestAction::Release => {
                    if let Some(done) = entry.take() {
                        self.pool.release(done).await;
                    }
                    break;
                }
                RequestAction::EvictAndReplace {
                    reason,
                    attempt,
                    status,
                } => {
                    self.reporter.report(&PoolEvent::RequestRetrying {
                        request,
                        worker,
                        attempt,
                        reason,
                        status,
                    });
                    if let Some(failed) = entry.take() {
                        self.pool.evict(failed, reason).await;
                    }
                    hold(&mut entry, self.pool.acquire_fresh().await)
                }
                RequestAction::Evict { reason } => {
                    if let Some(failed) = entry.take() {
                        self.pool.evict(failed, reason).await;
                    }
                    break;
                }
                RequestAction::None => break,
            };
        }

        if let Some(leftover) = entry.take() {
            self.pool.release(leftover).await;
        }

        match state {
            RequestState::Done {
                status,
                bytes,
                attempts,
            } => {
                self.reporter.report(&PoolEvent::RequestSucceeded {
                    request,
                    worker,
                    status,
                    bytes,
                    attempts,
                });
                RequestResult::Done {
                    status,
                    bytes,
                    attempts,
                }
            }
            RequestState::Failed { reason, attempts } => {
                self.reporter.report(&PoolEvent::RequestFailed {
                    request,
                    worker,
                    reason,
                    attempts,
                });
                RequestResult::Failed { reason, attempts }
            }
            other => {
                warn!(state = ?other, "request stopped in a non-terminal state");
                let attempts = match other {
                    RequestState::Send { attempt } | RequestState::Replace { attempt } => attempt,
                    _ => 0,
                };
                self.reporter.report(&PoolEvent::RequestFailed {
                    request,
                    worker,
                    reason: FailureKind::PoolExhausted,
                    attempts,
                });
                RequestResult::Failed {
                    reason: FailureKind::PoolExhausted,
                    attempts,
                }
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        entry: &PoolEntry,
        request: usize,
        worker: usize,
        attempt: u32,
    ) -> AttemptResult {
        self.reporter.report(&PoolEvent::RequestStarted {
            request,
            worker,
            identity: entry.identity().clone(),
            attempt,
        });
        let timeout = self.settings.request_timeout;
        let result = match tokio::time::timeout(timeout, entry.session().get(url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if let Err(e) = &result {
            debug!(identity = %entry.identity(), attempt, error = %e, "send failed");
        }
        classify_send(&result)
    }
}

/// Store an acquired entry and turn the acquisition into an event.
fn hold(slot: &mut Option<PoolEntry>, acquired: Result<PoolEntry>) -> RequestEvent {
    match acquired {
        Ok(entry) => {
            *slot = Some(entry);
            RequestEvent::SessionAcquired
        }
        Err(e) => {
            warn!(error = %e, "no identity available for request");
            RequestEvent::AcquireFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::testing::{FakeNetwork, RecordingReporter, Scripted, open_pool};

    const TARGET: &str = "https://example.com/";

    fn success(status: u16) -> RequestEvent {
        RequestEvent::Sent(AttemptResult::Success { status, bytes: 10 })
    }

    fn retry(kind: FailureKind, status: Option<u16>) -> RequestEvent {
        RequestEvent::Sent(AttemptResult::Retry { kind, status })
    }

    async fn dispatcher(
        net: &Arc<FakeNetwork>,
        dir: &tempfile::TempDir,
        prepared: usize,
    ) -> (Dispatcher, Arc<RecordingReporter>) {
        let (pool, reporter) = open_pool(net, dir).await;
        assert_eq!(pool.prepare(prepared).await, prepared);
        let dispatcher = Dispatcher::new(
            Arc::new(pool),
            DispatchSettings::default(),
            reporter.clone(),
        );
        (dispatcher, reporter)
    }

    #[test]
    fn acquire_then_send() {
        let (state, action) = handle_event(RequestState::Acquire, RequestEvent::SessionAcquired, 3);
        assert_eq!(state, RequestState::Send { attempt: 1 });
        assert_eq!(action, RequestAction::Send { attempt: 1 });
    }

    #[test]
    fn acquire_failure_is_terminal() {
        let (state, action) = handle_event(RequestState::Acquire, RequestEvent::AcquireFailed, 3);
        assert_eq!(
            state,
            RequestState::Failed {
                reason: FailureKind::PoolExhausted,
                attempts: 0
            }
        );
        assert_eq!(action, RequestAction::None);
    }

    #[test]
    fn success_releases_session() {
        let (state, action) = handle_event(RequestState::Send { attempt: 2 }, success(200), 3);
        assert_eq!(
            state,
            RequestState::Done {
                status: 200,
                bytes: 10,
                attempts: 2
            }
        );
        assert_eq!(action, RequestAction::Release);
    }

    #[test]
    fn retryable_failure_below_ceiling_replaces() {
        let (state, action) = handle_event(
            RequestState::Send { attempt: 1 },
            retry(FailureKind::ServerError, Some(503)),
            3,
        );
        assert_eq!(state, RequestState::Replace { attempt: 1 });
        assert_eq!(
            action,
            RequestAction::EvictAndReplace {
                reason: FailureKind::ServerError,
                attempt: 1,
                status: Some(503)
            }
        );

        let (state, action) = handle_event(state, RequestEvent::SessionAcquired, 3);
        assert_eq!(state, RequestState::Send { attempt: 2 });
        assert_eq!(action, RequestAction::Send { attempt: 2 });
    }

    #[test]
    fn retryable_failure_at_ceiling_fails() {
        let (state, action) = handle_event(
            RequestState::Send { attempt: 3 },
            retry(FailureKind::Transport, None),
            3,
        );
        assert_eq!(
            state,
            RequestState::Failed {
                reason: FailureKind::Transport,
                attempts: 3
            }
        );
        assert_eq!(
            action,
            RequestAction::Evict {
                reason: FailureKind::Transport
            }
        );
        assert!(state.is_terminal());
    }

    #[test]
    fn replacement_failure_is_pool_exhausted() {
        let (state, _) = handle_event(
            RequestState::Replace { attempt: 2 },
            RequestEvent::AcquireFailed,
            3,
        );
        assert_eq!(
            state,
            RequestState::Failed {
                reason: FailureKind::PoolExhausted,
                attempts: 2
            }
        );
    }

    #[test]
    fn unexpected_event_is_ignored() {
        let (state, action) = handle_event(
            RequestState::Done {
                status: 200,
                bytes: 1,
                attempts: 1,
            },
            RequestEvent::SessionAcquired,
            3,
        );
        assert!(matches!(state, RequestState::Done { .. }));
        assert_eq!(action, RequestAction::None);
    }

    #[tokio::test]
    async fn always_failing_transport_stops_at_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        net.set_default_reply(Scripted::TransportError);
        let (dispatcher, reporter) = dispatcher(&net, &dir, 0).await;

        let outcome = dispatcher.run_request(TARGET, 1, 1).await;

        assert_eq!(
            outcome.result,
            RequestResult::Failed {
                reason: FailureKind::Transport,
                attempts: 3
            }
        );
        assert_eq!(net.sends().len(), 3);
        assert_eq!(
            reporter.count(|e| matches!(e, PoolEvent::IdentityEvicted { .. })),
            3
        );
        assert!(dispatcher.pool().live_identities().await.is_empty());
        assert!(outcome.request_id.starts_with("req_"));
    }

    #[tokio::test]
    async fn rate_limited_exit_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1", "10.0.0.2"]);
        net.script("10.0.0.1", &[Scripted::Status(429)]);
        let (dispatcher, reporter) = dispatcher(&net, &dir, 1).await;

        let outcome = dispatcher.run_request(TARGET, 1, 1).await;

        assert!(
            matches!(outcome.result, RequestResult::Done { status: 200, attempts: 2, .. }),
            "got: {:?}",
            outcome.result
        );
        assert_eq!(
            reporter.count(|e| matches!(
                e,
                PoolEvent::RequestRetrying {
                    reason: FailureKind::RateLimited,
                    status: Some(429),
                    ..
                }
            )),
            1
        );
        let used = dispatcher.pool().used_identities().await;
        assert!(!used.contains(&Identity::from("10.0.0.1")));
        assert!(used.contains(&Identity::from("10.0.0.2")));
    }

    #[tokio::test]
    async fn client_error_status_completes_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        net.script("10.0.0.1", &[Scripted::Status(404)]);
        let (dispatcher, _) = dispatcher(&net, &dir, 1).await;

        let outcome = dispatcher.run_request(TARGET, 1, 1).await;
        assert!(matches!(
            outcome.result,
            RequestResult::Done {
                status: 404,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn successful_request_returns_entry_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        let (dispatcher, _) = dispatcher(&net, &dir, 1).await;

        let outcome = dispatcher.run_request(TARGET, 1, 1).await;
        assert!(outcome.result.is_done());
        assert_eq!(
            dispatcher.pool().queued_identities().await,
            vec![Identity::from("10.0.0.1")]
        );
    }

    #[tokio::test]
    async fn empty_network_fails_request_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&[]);
        let (dispatcher, reporter) = dispatcher(&net, &dir, 0).await;

        let outcomes = dispatcher.run_all(TARGET, 2).await;

        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert_eq!(
                outcome.result,
                RequestResult::Failed {
                    reason: FailureKind::PoolExhausted,
                    attempts: 0
                }
            );
        }
        assert_eq!(
            reporter.count(|e| matches!(e, PoolEvent::RequestFailed { .. })),
            2
        );
    }

    #[tokio::test]
    async fn failed_replacement_ends_request() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        net.set_default_reply(Scripted::TransportError);
        let (dispatcher, _) = dispatcher(&net, &dir, 1).await;

        let outcome = dispatcher.run_request(TARGET, 1, 1).await;
        assert_eq!(
            outcome.result,
            RequestResult::Failed {
                reason: FailureKind::PoolExhausted,
                attempts: 1
            }
        );
        assert_eq!(net.sends().len(), 1);
    }

    #[tokio::test]
    async fn server_error_on_one_request_leaves_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&[
            "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6",
        ]);
        net.script("10.0.0.3", &[Scripted::Status(503)]);
        let (dispatcher, reporter) = dispatcher(&net, &dir, 5).await;

        let outcomes = dispatcher.run_all(TARGET, 5).await;

        assert_eq!(outcomes.len(), 5);
        let requests: Vec<usize> = outcomes.iter().map(|o| o.request).collect();
        assert_eq!(requests, vec![1, 2, 3, 4, 5]);
        assert!(outcomes.iter().all(|o| (1..=5).contains(&o.worker)));

        let retried: Vec<&RequestOutcome> = outcomes
            .iter()
            .filter(|o| matches!(o.result, RequestResult::Done { attempts: 2, .. }))
            .collect();
        assert_eq!(retried.len(), 1);
        let first_try = outcomes
            .iter()
            .filter(|o| matches!(o.result, RequestResult::Done { status: 200, attempts: 1, .. }))
            .count();
        assert_eq!(first_try, 4);

        let sends = net.sends();
        assert_eq!(sends.len(), 6);
        assert_eq!(
            sends
                .iter()
                .filter(|exit| exit.as_deref() == Some("10.0.0.3"))
                .count(),
            1
        );
        assert_eq!(
            reporter.count(|e| matches!(
                e,
                PoolEvent::IdentityEvicted {
                    reason: FailureKind::ServerError,
                    ..
                }
            )),
            1
        );
        assert!(
            !dispatcher
                .pool()
                .used_identities()
                .await
                .contains(&Identity::from("10.0.0.3"))
        );
        assert_eq!(net.overlaps(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_never_share_an_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exits: Vec<String> = (1..=20).map(|i| format!("10.0.1.{i}")).collect();
        let exits: Vec<&str> = exits.iter().map(String::as_str).collect();
        let net = FakeNetwork::with_exits(&exits);
        net.script("10.0.1.2", &[Scripted::Status(502)]);
        net.script("10.0.1.4", &[Scripted::TransportError]);
        let (dispatcher, reporter) = dispatcher(&net, &dir, 5).await;

        let outcomes = dispatcher.run_all(TARGET, 12).await;

        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(|o| o.result.is_done()));
        assert_eq!(net.overlaps(), 0);

        let succeeded = reporter
            .events()
            .into_iter()
            .filter(|e| matches!(e, PoolEvent::RequestSucceeded { .. }))
            .count();
        assert_eq!(succeeded, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_counts_as_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        let (pool, reporter) = open_pool(&net, &dir).await;
        let pool = Arc::new(pool);
        let dispatcher = Dispatcher::new(
            pool.clone(),
            DispatchSettings {
                request_timeout: Duration::from_secs(1),
                max_attempts: 1,
                max_workers: 1,
            },
            reporter,
        );

        let entry = PoolEntry::new(
            Identity::from("10.9.9.9"),
            crate::identity::Tag::new(3000),
            Box::new(crate::testing::StaticSession::hanging()),
        );
        let result = dispatcher.send(TARGET, &entry, 1, 1, 1).await;
        assert_eq!(
            result,
            AttemptResult::Retry {
                kind: FailureKind::Transport,
                status: None
            }
        );
    }
}
