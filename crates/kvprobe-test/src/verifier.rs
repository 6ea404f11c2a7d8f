//! Cross-member convergence check
//!
//! `ConvergencePoller` is the pure state machine: feed it each HashKV
//! result together with the current instant and it says whether to stop
//! or when to poll again. `verify_converged` drives it against a client.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use kvprobe_client::KvClient;
use kvprobe_core::{
    ConvergenceTimeout, HashSnapshot, ProbeError, ProbeResult, TransportError, TransportErrorKind,
};

/// How far past the verify timeout an in-flight poll may run
pub const POLL_GRACE: Duration = Duration::from_secs(1);

/// Poller state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Converged,
    TimedOut,
}

/// Why one poll did not pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mismatch {
    MemberCount { expected: usize, actual: usize },
    Revisions(Vec<i64>),
    Hashes(Vec<u32>),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::MemberCount { expected, actual } => {
                write!(f, "expected {} members, {} answered", expected, actual)
            }
            Mismatch::Revisions(revisions) => write!(f, "revisions differ: {:?}", revisions),
            Mismatch::Hashes(hashes) => {
                let hashes: Vec<String> = hashes.iter().map(|h| format!("{:08x}", h)).collect();
                write!(f, "hashes differ: [{}]", hashes.join(", "))
            }
        }
    }
}

/// Check that exactly `expected` members answered with one revision and one hash
pub fn check_agreement(snapshots: &[HashSnapshot], expected: usize) -> Result<(), Mismatch> {
    if snapshots.len() != expected {
        return Err(Mismatch::MemberCount {
            expected,
            actual: snapshots.len(),
        });
    }
    let Some(first) = snapshots.first() else {
        return Ok(());
    };
    if snapshots.iter().any(|s| s.revision != first.revision) {
        return Err(Mismatch::Revisions(
            snapshots.iter().map(|s| s.revision).collect(),
        ));
    }
    if snapshots.iter().any(|s| s.hash != first.hash) {
        return Err(Mismatch::Hashes(snapshots.iter().map(|s| s.hash).collect()));
    }
    Ok(())
}

/// Members agreed
#[derive(Clone, Debug, Serialize)]
pub struct Converged {
    pub polls: u32,
    pub elapsed_ms: u64,
    pub revision: i64,
    pub hash: u32,
    pub snapshots: Vec<HashSnapshot>,
}

/// What the driver does after an observation
#[derive(Debug)]
pub enum PollStep {
    /// Poll again after the delay
    Retry(Duration),
    Done(Converged),
    TimedOut(ConvergenceTimeout),
}

/// Convergence state machine with injected time
#[derive(Debug)]
pub struct ConvergencePoller {
    expected: usize,
    timeout: Duration,
    interval: Duration,
    started: Instant,
    polls: u32,
    last: Vec<HashSnapshot>,
    last_reason: Option<String>,
    state: PollState,
}

impl ConvergencePoller {
    pub fn new(expected: usize, timeout: Duration, interval: Duration, started: Instant) -> Self {
        ConvergencePoller {
            expected,
            timeout,
            interval,
            started,
            polls: 0,
            last: Vec::new(),
            last_reason: None,
            state: PollState::Polling,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Snapshots from the last poll that returned any
    pub fn last_snapshots(&self) -> &[HashSnapshot] {
        &self.last
    }

    /// Record one HashKV result observed at `now`.
    ///
    /// Observations after a terminal state are ignored and repeat the
    /// terminal step.
    pub fn observe(
        &mut self,
        now: Instant,
        result: Result<Vec<HashSnapshot>, TransportError>,
    ) -> PollStep {
        if self.state != PollState::Polling {
            return self.finish(now);
        }
        self.polls += 1;

        match result {
            Ok(snapshots) => match check_agreement(&snapshots, self.expected) {
                Ok(()) => {
                    self.last = snapshots;
                    self.last_reason = None;
                    self.state = PollState::Converged;
                    return self.finish(now);
                }
                Err(mismatch) => {
                    tracing::warn!(
                        attempt = self.polls,
                        reason = %mismatch,
                        "members not converged yet"
                    );
                    self.last = snapshots;
                    self.last_reason = Some(mismatch.to_string());
                }
            },
            Err(e) => {
                tracing::warn!(attempt = self.polls, error = %e, "hash_kv poll failed");
                self.last_reason = Some(e.to_string());
            }
        }

        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.timeout {
            self.state = PollState::TimedOut;
            return self.finish(now);
        }
        PollStep::Retry(self.interval.min(self.timeout - elapsed))
    }

    /// Terminal step for the current state; `Retry(ZERO)` while still polling
    pub fn finish(&self, now: Instant) -> PollStep {
        let elapsed = now.saturating_duration_since(self.started);
        match self.state {
            PollState::Polling => PollStep::Retry(Duration::ZERO),
            PollState::Converged => {
                let (revision, hash) = self
                    .last
                    .first()
                    .map(|s| (s.revision, s.hash))
                    .unwrap_or_default();
                PollStep::Done(Converged {
                    polls: self.polls,
                    elapsed_ms: elapsed.as_millis() as u64,
                    revision,
                    hash,
                    snapshots: self.last.clone(),
                })
            }
            PollState::TimedOut => PollStep::TimedOut(ConvergenceTimeout {
                elapsed,
                polls: self.polls,
                expected_members: self.expected,
                last: self.last.clone(),
                last_reason: self.last_reason.clone(),
            }),
        }
    }
}

/// Poll `hash_kv(0)` until `expected` members agree or `timeout` passes.
///
/// At least one poll is always issued. A poll still running `POLL_GRACE`
/// after the timeout is abandoned and counts as a failed poll.
/// Cancellation returns `Cancelled` without issuing further calls.
pub async fn verify_converged(
    client: &dyn KvClient,
    expected: usize,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> ProbeResult<Converged> {
    if expected == 0 {
        return Err(ProbeError::Config("expected member count must be at least 1".into()));
    }

    let started = tokio::time::Instant::now();
    let poll_deadline = started + timeout + POLL_GRACE;
    let mut poller = ConvergencePoller::new(expected, timeout, poll_interval, started.into_std());

    loop {
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled("verify".into())),
            result = tokio::time::timeout_at(poll_deadline, client.hash_kv(0)) => {
                result.unwrap_or_else(|_| Err(TransportError::new(
                    TransportErrorKind::Unavailable,
                    "hash_kv",
                    client.endpoints(),
                    "no answer before the verify deadline",
                )))
            }
        };

        match poller.observe(tokio::time::Instant::now().into_std(), observed) {
            PollStep::Done(converged) => {
                tracing::info!(
                    polls = converged.polls,
                    revision = converged.revision,
                    hash = %format_args!("{:08x}", converged.hash),
                    "members converged"
                );
                return Ok(converged);
            }
            PollStep::TimedOut(timeout) => return Err(timeout.into()),
            PollStep::Retry(delay) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled("verify".into())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
