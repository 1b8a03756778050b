//! Console output: per-event lines on stdout and the end-of-run summary

use std::fmt;
use std::io::Write;

use identity_pool::{PoolEvent, Reporter, RequestOutcome, RequestResult, TracingReporter};

use crate::metrics;

/// Prints each event's text on stdout, records metrics, and mirrors the
/// event into the log.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, event: &PoolEvent) {
        metrics::record_event(event);
        TracingReporter.report(event);
        if is_user_facing(event) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{event}");
        }
    }
}

/// Events worth a line on stdout. The rest only go to the log.
fn is_user_facing(event: &PoolEvent) -> bool {
    !matches!(
        event,
        PoolEvent::RequestStarted { .. }
            | PoolEvent::CacheWriteFailed { .. }
            | PoolEvent::IdentityRejected { identity: None, .. }
    )
}

/// Totals over a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub requested: usize,
    pub done: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_outcomes(requested: usize, outcomes: &[RequestOutcome]) -> Self {
        let done = outcomes.iter().filter(|o| o.result.is_done()).count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.result, RequestResult::Failed { .. }))
            .count();
        Self {
            requested,
            done,
            failed,
        }
    }

    pub fn all_done(&self) -> bool {
        self.done == self.requested
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Completed {}/{} requests ({} failed)",
            self.done, self.requested, self.failed
        )
    }
}
