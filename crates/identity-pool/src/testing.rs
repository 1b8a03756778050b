//! In-process fakes for the control channel, the SOCKS transport and the
//! reporter.
//!
//! `FakeNetwork` plays the Tor daemon: each rotation moves to the next
//! scripted exit, and sessions built afterwards answer the probe URL with
//! that exit address. Target requests are answered from a per-exit script.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tempfile::TempDir;
use tor_control::ControlChannel;
use transport::{HttpResponse, HttpSession, SessionBuilder, TransportError};

use crate::cache::{CacheRecord, CachedSession, IdentityCache};
use crate::factory::{FactorySettings, IdentityFactory};
use crate::pool::{PoolSettings, SessionPool};
use crate::report::{PoolEvent, Reporter};
use crate::validator::Validator;

pub(crate) const PROBE_URL: &str = "http://probe.test/ip";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A session with one fixed answer for every URL.
pub(crate) struct StaticSession {
    reply: Option<HttpResponse>,
    hang: bool,
}

impl StaticSession {
    pub(crate) fn ok() -> Self {
        Self::body(200, r#"{"ip": "198.51.100.1"}"#)
    }

    pub(crate) fn status(status: u16) -> Self {
        Self::body(status, "")
    }

    pub(crate) fn body(status: u16, body: &str) -> Self {
        Self {
            reply: Some(HttpResponse::new(status, body)),
            hang: false,
        }
    }

    pub(crate) fn broken() -> Self {
        Self {
            reply: None,
            hang: false,
        }
    }

    pub(crate) fn hanging() -> Self {
        Self {
            reply: None,
            hang: true,
        }
    }
}

impl HttpSession for StaticSession {
    fn get<'a>(
        &'a self,
        _url: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, transport::Result<HttpResponse>> {
        Box::pin(async move {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.reply
                .clone()
                .ok_or_else(|| TransportError::Connect("connection refused".into()))
        })
    }
}

/// Scripted answer to a target request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scripted {
    Status(u16),
    TransportError,
}

struct NetState {
    exits: VecDeque<String>,
    current: Option<String>,
    failing_rotations: u32,
    rotations: u32,
    builds: usize,
    dead_builds: HashSet<usize>,
    flaky_exits: HashSet<String>,
    scripts: HashMap<String, VecDeque<Scripted>>,
    default_reply: Scripted,
    sends: Vec<Option<String>>,
    in_flight: HashSet<String>,
    overlaps: usize,
    closed: usize,
}

pub(crate) struct FakeNetwork {
    me: Weak<FakeNetwork>,
    state: Mutex<NetState>,
}

impl FakeNetwork {
    /// A network whose successive rotations land on `exits`, in order.
    pub(crate) fn with_exits(exits: &[&str]) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(NetState {
                exits: exits.iter().map(|e| e.to_string()).collect(),
                current: None,
                failing_rotations: 0,
                rotations: 0,
                builds: 0,
                dead_builds: HashSet::new(),
                flaky_exits: HashSet::new(),
                scripts: HashMap::new(),
                default_reply: Scripted::Status(200),
                sends: Vec::new(),
                in_flight: HashSet::new(),
                overlaps: 0,
                closed: 0,
            }),
        })
    }

    /// Factory settings pointed at the fake probe, with no settle delay.
    pub(crate) fn factory_settings() -> FactorySettings {
        FactorySettings {
            probe_url: PROBE_URL.to_string(),
            probe_timeout: Duration::from_secs(10),
            settle_delay: Duration::ZERO,
        }
    }

    pub(crate) fn validator() -> Validator {
        Validator::new(PROBE_URL, Duration::from_secs(10))
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_rotations(&self, n: u32) {
        self.lock().failing_rotations = n;
    }

    /// Sessions from the `n`th build (1-based) fail every request.
    pub(crate) fn kill_build(&self, n: usize) {
        self.lock().dead_builds.insert(n);
    }

    /// The exit answers its first probe, then stops responding to probes.
    pub(crate) fn flaky_exit(&self, exit: &str) {
        self.lock().flaky_exits.insert(exit.to_string());
    }

    /// Queue target replies for sessions exiting through `exit`.
    pub(crate) fn script(&self, exit: &str, replies: &[Scripted]) {
        self.lock()
            .scripts
            .entry(exit.to_string())
            .or_default()
            .extend(replies.iter().copied());
    }

    /// Reply used once an exit's script is empty.
    pub(crate) fn set_default_reply(&self, reply: Scripted) {
        self.lock().default_reply = reply;
    }

    pub(crate) fn rotations(&self) -> u32 {
        self.lock().rotations
    }

    pub(crate) fn builds(&self) -> usize {
        self.lock().builds
    }

    /// Exit of every target request sent, in order.
    pub(crate) fn sends(&self) -> Vec<Option<String>> {
        self.lock().sends.clone()
    }

    /// Times two target requests were in flight through the same exit.
    pub(crate) fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    /// Sessions dropped so far.
    pub(crate) fn closed(&self) -> usize {
        self.lock().closed
    }
}

impl ControlChannel for FakeNetwork {
    fn request_new_circuit(&self) -> BoxFuture<'_, tor_control::Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.rotations += 1;
            if state.failing_rotations > 0 {
                state.failing_rotations -= 1;
                return Err(tor_control::Error::Authentication("scripted failure".into()));
            }
            match state.exits.pop_front() {
                Some(exit) => {
                    state.current = Some(exit);
                    Ok(())
                }
                None => Err(tor_control::Error::Connect("no circuits left".into())),
            }
        })
    }
}

impl SessionBuilder for FakeNetwork {
    fn build(&self) -> transport::Result<Box<dyn HttpSession>> {
        let net = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::Build("network dropped".into()))?;
        let mut state = self.lock();
        state.builds += 1;
        let dead = state.dead_builds.contains(&state.builds);
        let exit = state.current.clone();
        drop(state);
        Ok(Box::new(FakeSession {
            net,
            exit,
            dead,
            probes: AtomicU32::new(0),
        }))
    }
}

struct FakeSession {
    net: Arc<FakeNetwork>,
    exit: Option<String>,
    dead: bool,
    probes: AtomicU32,
}

impl FakeSession {
    fn probe(&self) -> transport::Result<HttpResponse> {
        let previous = self.probes.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .exit
            .as_ref()
            .is_some_and(|exit| self.net.lock().flaky_exits.contains(exit));
        if flaky && previous > 0 {
            return Err(TransportError::Timeout(Duration::from_secs(10)));
        }
        let ip = self.exit.as_deref().unwrap_or("192.0.2.1");
        Ok(HttpResponse::new(200, format!(r#"{{"ip": "{ip}"}}"#)))
    }

    async fn target(&self) -> transport::Result<HttpResponse> {
        let reply = {
            let mut state = self.net.lock();
            state.sends.push(self.exit.clone());
            if let Some(exit) = &self.exit {
                if !state.in_flight.insert(exit.clone()) {
                    state.overlaps += 1;
                }
            }
            let default = state.default_reply;
            self.exit
                .as_ref()
                .and_then(|exit| state.scripts.get_mut(exit))
                .and_then(|script| script.pop_front())
                .unwrap_or(default)
        };

        // Give other workers a chance to collide on this exit
        tokio::task::yield_now().await;

        if let Some(exit) = &self.exit {
            self.net.lock().in_flight.remove(exit);
        }
        match reply {
            Scripted::Status(status) => Ok(HttpResponse::new(status, "<html>target page</html>")),
            Scripted::TransportError => Err(TransportError::Connect("circuit collapsed".into())),
        }
    }
}

impl HttpSession for FakeSession {
    fn get<'a>(
        &'a self,
        url: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, transport::Result<HttpResponse>> {
        Box::pin(async move {
            if self.dead {
                return Err(TransportError::Connect("dead circuit".into()));
            }
            if url == PROBE_URL {
                self.probe()
            } else {
                self.target().await
            }
        })
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.net.state.lock() {
            state.closed += 1;
        }
    }
}

/// Collects every reported event.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&PoolEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &PoolEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Open a pool on `net` with its cache in `dir` and no backoff.
pub(crate) async fn open_pool(
    net: &Arc<FakeNetwork>,
    dir: &TempDir,
) -> (SessionPool, Arc<RecordingReporter>) {
    let reporter = Arc::new(RecordingReporter::default());
    let pool = SessionPool::open(
        IdentityFactory::new(net.clone(), net.clone(), FakeNetwork::factory_settings()),
        FakeNetwork::validator(),
        IdentityCache::new(dir.path().join("cache.json")),
        PoolSettings {
            max_fresh_attempts: 10,
            fresh_backoff: Duration::ZERO,
        },
        reporter.clone(),
    )
    .await;
    (pool, reporter)
}

/// Write a cache file naming `entries` as live sessions, in the given order.
pub(crate) async fn seed_cache(dir: &TempDir, entries: &[(&str, u16)]) {
    let record = CacheRecord {
        ips: entries.iter().map(|(ip, _)| ip.to_string()).collect(),
        sessions: entries
            .iter()
            .map(|(ip, port)| CachedSession {
                ip: ip.to_string(),
                port: *port,
            })
            .collect(),
    };
    IdentityCache::new(dir.path().join("cache.json"))
        .save(&record)
        .await
        .unwrap();
}
