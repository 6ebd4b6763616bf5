use std::time::Duration;

use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::Logger;
use tokio::time::Instant;

use crate::backend::ElectionStatus;
use crate::coordinator::Election;
use crate::error::Error;

/// What a [`LoopingElectionLogic`] hook tells the loop to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopingElectionControl {
    /// Keep looping, re-checking status on the next iteration.
    Continue,
    /// Stop `loop_forever` entirely.
    Exit,
    /// This hook has nothing to add; fall through to the next step.
    Proceed,
    /// Force the election to be re-run on the next iteration.
    ReRun,
    /// Step down from primary (if held) and re-run the election.
    StepDown,
}

/// User logic plugged into a [`LoopingElection`].
///
/// `primary` is invoked once per loop iteration while this node holds the election; it must be
/// bounded (no internal `loop { }`) so the surrounding loop can re-check liveness between calls
/// and notice promptly if the election is lost.
#[async_trait]
pub trait LoopingElectionLogic: Send + Sync {
    /// Called when an election operation (`run`/`step_down`) fails.
    async fn handle_error(&self, error: Error) -> LoopingElectionControl;

    /// Called while not contending (before the first `run`, or after a terminal failure).
    async fn not_candidate(&self) -> LoopingElectionControl {
        LoopingElectionControl::ReRun
    }

    /// Called after `primary`, before deciding the loop's next control flow.
    async fn post_check(&self) -> LoopingElectionControl {
        LoopingElectionControl::Proceed
    }

    /// Called before `primary`, to allow bailing out without running it.
    async fn pre_check(&self) -> LoopingElectionControl {
        LoopingElectionControl::Proceed
    }

    /// Called once per iteration while this node is primary.
    async fn primary(&self) -> LoopingElectionControl;

    /// Called once per iteration while this node is a non-primary candidate.
    async fn secondary(&self) -> LoopingElectionControl {
        LoopingElectionControl::Proceed
    }

    /// Called when the election has terminated, with the backend-reported reason.
    async fn terminated(&self, reason: &str) -> LoopingElectionControl {
        let _ = reason;
        LoopingElectionControl::ReRun
    }
}

/// Tuning options for a [`LoopingElection`].
pub struct LoopingElectionOpts {
    election_term: Option<Duration>,
    loop_delay: Duration,
}

impl LoopingElectionOpts {
    pub fn new() -> Self {
        LoopingElectionOpts {
            election_term: Some(Duration::from_secs(60)),
            loop_delay: Duration::from_millis(500),
        }
    }

    /// Never force a re-run purely on a timer; only react to status changes.
    pub fn clear_election_term(mut self) -> Self {
        self.election_term = None;
        self
    }

    pub fn election_term(mut self, term: Duration) -> Self {
        self.election_term = Some(term);
        self
    }

    pub fn loop_delay(mut self, delay: Duration) -> Self {
        self.loop_delay = delay;
        self
    }
}

impl Default for LoopingElectionOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an [`Election`] through repeated `run`/status-check/act cycles, delegating the
/// decision at each status to a [`LoopingElectionLogic`].
pub struct LoopingElection {
    election: Election,
    election_term: Option<Duration>,
    election_term_current: Option<Instant>,
    logger: Logger,
    logic: Box<dyn LoopingElectionLogic>,
    loop_delay: Duration,
    was_primary: bool,
}

impl LoopingElection {
    pub fn new(
        election: Election,
        logic: Box<dyn LoopingElectionLogic>,
        opts: LoopingElectionOpts,
        logger: Logger,
    ) -> LoopingElection {
        LoopingElection {
            election,
            election_term: opts.election_term,
            election_term_current: None,
            logger,
            logic,
            loop_delay: opts.loop_delay,
            was_primary: false,
        }
    }

    /// Run the election loop until a hook returns [`LoopingElectionControl::Exit`].
    pub async fn loop_forever(&mut self) {
        loop {
            if self.loop_once().await == LoopingElectionControl::Exit {
                break;
            }
            tokio::time::sleep(self.loop_delay).await;
        }
    }

    /// Run a single iteration: re-join the election if needed, check status, act.
    pub async fn loop_once(&mut self) -> LoopingElectionControl {
        if self.rerun_due() {
            self.election_term_current = None;
        }
        if self.election_term_current.is_none() {
            if let Err(error) = self.election.run().await {
                let control = self.logic.handle_error(error).await;
                return self.handle_control_flow(control).await;
            }
            self.election_term_current = self.election_term.map(|term| Instant::now() + term);
        }

        let control = match self.election.status() {
            ElectionStatus::NotCandidate => self.logic.not_candidate().await,
            ElectionStatus::InProgress => LoopingElectionControl::Proceed,
            ElectionStatus::Primary => self.primary().await,
            ElectionStatus::Secondary => self.secondary().await,
            ElectionStatus::Terminated(reason) => self.logic.terminated(&reason).await,
        };
        self.handle_control_flow(control).await
    }

    fn rerun_due(&self) -> bool {
        matches!(self.election_term_current, Some(deadline) if Instant::now() >= deadline)
    }

    async fn primary(&mut self) -> LoopingElectionControl {
        if !self.was_primary {
            info!(self.logger, "acquired election primary status");
            crate::metrics::ELECTION_PRIMARY_TOTAL.inc();
            self.was_primary = true;
        }
        match self.logic.pre_check().await {
            LoopingElectionControl::Proceed => (),
            other => return other,
        }
        let control = self.logic.primary().await;
        match self.logic.post_check().await {
            LoopingElectionControl::Proceed => control,
            other => other,
        }
    }

    async fn secondary(&mut self) -> LoopingElectionControl {
        if self.was_primary {
            info!(self.logger, "lost election primary status");
            self.was_primary = false;
        }
        self.logic.secondary().await
    }

    async fn handle_control_flow(&mut self, control: LoopingElectionControl) -> LoopingElectionControl {
        match control {
            LoopingElectionControl::StepDown => {
                if let Err(error) = self.election.step_down().await {
                    debug!(self.logger, "error stepping down from election"; "error" => %error);
                }
                self.election_term_current = None;
                self.was_primary = false;
                LoopingElectionControl::Continue
            }
            LoopingElectionControl::ReRun => {
                self.election_term_current = None;
                LoopingElectionControl::Continue
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use async_trait::async_trait;
    use slog::o;
    use slog::Discard;

    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::Backend;
    use crate::NodeId;

    struct CountingLogic {
        primary_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LoopingElectionLogic for CountingLogic {
        async fn handle_error(&self, _error: Error) -> LoopingElectionControl {
            LoopingElectionControl::Exit
        }

        async fn primary(&self) -> LoopingElectionControl {
            self.primary_calls.fetch_add(1, Ordering::SeqCst);
            LoopingElectionControl::Exit
        }
    }

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    #[tokio::test]
    async fn primary_runs_once_then_exits() {
        let backend = MockBackend::new(NodeId::new());
        let election = Election::new(backend.election("/elections/test"));
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let logic = Box::new(CountingLogic {
            primary_calls: primary_calls.clone(),
        });
        let mut looping = LoopingElection::new(election, logic, LoopingElectionOpts::new(), logger());
        looping.loop_forever().await;
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    struct RerunThenExitLogic {
        reruns_left: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LoopingElectionLogic for RerunThenExitLogic {
        async fn handle_error(&self, _error: Error) -> LoopingElectionControl {
            LoopingElectionControl::Exit
        }

        async fn primary(&self) -> LoopingElectionControl {
            if self.reruns_left.fetch_sub(1, Ordering::SeqCst) == 0 {
                LoopingElectionControl::Exit
            } else {
                LoopingElectionControl::ReRun
            }
        }
    }

    #[tokio::test]
    async fn rerun_control_keeps_looping() {
        let backend = MockBackend::new(NodeId::new());
        let election = Election::new(backend.election("/elections/test"));
        let logic = Box::new(RerunThenExitLogic {
            reruns_left: std::sync::atomic::AtomicUsize::new(2),
        });
        let opts = LoopingElectionOpts::new().loop_delay(Duration::from_millis(1));
        let mut looping = LoopingElection::new(election, logic, opts, logger());
        looping.loop_forever().await;
    }
}
