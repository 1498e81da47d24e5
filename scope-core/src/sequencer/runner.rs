//! Executes a [`Sequence`] in the background.
//!
//! One task walks the steps in order, writing each step's status back into
//! the shared sequence so callers can watch progress or save it. Pausing
//! holds the run between steps and freezes the remaining time of a running
//! wait; stopping cancels the task outright.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::sequence::{Sequence, SequenceState};
use super::step::{AstronomicalEvent, Site, Step, StepAction, StepStatus};
use crate::client::{ImagingClient, ScopeClient};
use crate::command::{GotoTarget, SetExposure, SetGain};
use crate::error::ScopeError;
use crate::task::TaskGroup;

const STOP_GRACE: Duration = Duration::from_secs(1);

/// Computes when an astronomical event next happens at a site.
pub trait EventClock: Send + Sync {
    fn next_occurrence(
        &self,
        event: AstronomicalEvent,
        site: &Site,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScopeError>;
}

// ── Context ──────────────────────────────────────────────────────

/// Collaborators the steps act through. Steps that need one that is
/// missing fail with [`ScopeError::MissingContext`].
#[derive(Clone)]
pub struct SequenceContext {
    client: Option<Arc<ScopeClient>>,
    imaging: Option<Arc<ImagingClient>>,
    clock: Option<Arc<dyn EventClock>>,
    goto_timeout: Duration,
}

impl Default for SequenceContext {
    fn default() -> Self {
        Self {
            client: None,
            imaging: None,
            clock: None,
            goto_timeout: Duration::from_secs(300),
        }
    }
}

impl SequenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: Arc<ScopeClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_imaging(mut self, imaging: Arc<ImagingClient>) -> Self {
        self.imaging = Some(imaging);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn EventClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// How long a slew may take before the step fails.
    pub fn with_goto_timeout(mut self, timeout: Duration) -> Self {
        self.goto_timeout = timeout;
        self
    }

    fn client(&self) -> Result<&ScopeClient, ScopeError> {
        self.client.as_deref().ok_or(ScopeError::MissingContext("scope client"))
    }

    fn imaging(&self) -> Result<&ImagingClient, ScopeError> {
        self.imaging.as_deref().ok_or(ScopeError::MissingContext("imaging client"))
    }

    fn clock(&self) -> Result<&dyn EventClock, ScopeError> {
        self.clock.as_deref().ok_or(ScopeError::MissingContext("event clock"))
    }
}

// ── SequenceRunner ───────────────────────────────────────────────

pub struct SequenceRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    sequence: Mutex<Sequence>,
    state: watch::Sender<SequenceState>,
    paused: watch::Sender<bool>,
    context: SequenceContext,
    tasks: Mutex<TaskGroup>,
}

enum Work {
    Nested { stop_on_error: bool },
    Leaf(StepAction),
}

impl SequenceRunner {
    /// A sequence saved mid-run comes back cancelled, ready to continue.
    pub fn new(mut sequence: Sequence, context: SequenceContext) -> Self {
        if sequence.state.is_active() {
            debug!(sequence = %sequence.name, state = %sequence.state, "loaded mid-run");
            for step in &mut sequence.steps {
                step.transition(StepStatus::Running, StepStatus::Cancelled);
                step.transition(StepStatus::Paused, StepStatus::Cancelled);
            }
            sequence.state = SequenceState::Cancelled;
        }
        let (state, _) = watch::channel(sequence.state);
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunnerInner {
                sequence: Mutex::new(sequence),
                state,
                paused,
                context,
                tasks: Mutex::new(TaskGroup::new()),
            }),
        }
    }

    /// Begin (or continue) the run from the current step. Completed steps
    /// are skipped, so a failed or stopped sequence picks up where it left
    /// off.
    pub fn start(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        {
            let mut sequence = inner.lock_sequence();
            if sequence.state.is_active() {
                return Err(ScopeError::SequenceState {
                    action: "start",
                    state: sequence.state.to_string(),
                });
            }
            sequence.validate()?;
            sequence.started_at = Some(Utc::now());
            sequence.completed_at = None;
            inner.set_state(&mut sequence, SequenceState::Running);
            info!(sequence = %sequence.name, steps = sequence.steps.len(), "sequence started");
        }
        inner.paused.send_replace(false);
        inner.lock_tasks().spawn("sequence", inner.clone().run());
        Ok(())
    }

    /// Cancel the run. The step in progress is marked cancelled. A no-op
    /// unless running or paused.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.lock_sequence().state.is_active() {
            return;
        }
        let tasks = inner.lock_tasks().cancel_and_take();
        TaskGroup::join_all(tasks, STOP_GRACE).await;
        inner.paused.send_replace(false);

        let mut sequence = inner.lock_sequence();
        if sequence.state.is_active() {
            for step in &mut sequence.steps {
                step.transition(StepStatus::Running, StepStatus::Cancelled);
                step.transition(StepStatus::Paused, StepStatus::Cancelled);
            }
            sequence.completed_at = Some(Utc::now());
            inner.set_state(&mut sequence, SequenceState::Cancelled);
            info!(sequence = %sequence.name, "sequence cancelled");
        }
    }

    /// Hold the run. A wait in progress keeps its remaining time; a slew
    /// or imaging call in flight finishes, and the next step waits.
    pub fn pause(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        let mut sequence = inner.lock_sequence();
        if sequence.state != SequenceState::Running {
            return Err(ScopeError::SequenceState {
                action: "pause",
                state: sequence.state.to_string(),
            });
        }
        for step in &mut sequence.steps {
            step.transition(StepStatus::Running, StepStatus::Paused);
        }
        inner.set_state(&mut sequence, SequenceState::Paused);
        inner.paused.send_replace(true);
        info!(sequence = %sequence.name, "sequence paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        let mut sequence = inner.lock_sequence();
        if sequence.state != SequenceState::Paused {
            return Err(ScopeError::SequenceState {
                action: "resume",
                state: sequence.state.to_string(),
            });
        }
        for step in &mut sequence.steps {
            step.transition(StepStatus::Paused, StepStatus::Running);
        }
        inner.set_state(&mut sequence, SequenceState::Running);
        inner.paused.send_replace(false);
        info!(sequence = %sequence.name, "sequence resumed");
        Ok(())
    }

    /// Snapshot of the sequence, including per-step progress.
    pub fn sequence(&self) -> Sequence {
        self.inner.lock_sequence().clone()
    }

    pub fn state(&self) -> SequenceState {
        *self.inner.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SequenceState> {
        self.inner.state.subscribe()
    }

    /// Wait for the run to complete, fail or be cancelled.
    pub async fn wait(&self) -> SequenceState {
        let mut state = self.state_receiver();
        loop {
            let current = *state.borrow_and_update();
            if current.is_finished() {
                return current;
            }
            if state.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl Drop for SequenceRunner {
    fn drop(&mut self) {
        self.inner.lock_tasks().cancel();
    }
}

// ── Execution ────────────────────────────────────────────────────

impl RunnerInner {
    async fn run(self: Arc<Self>) {
        let outcome = self.run_steps(Vec::new(), true).await;

        let mut sequence = self.lock_sequence();
        sequence.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                self.set_state(&mut sequence, SequenceState::Completed);
                info!(sequence = %sequence.name, "sequence completed");
            }
            Err(e) => {
                self.set_state(&mut sequence, SequenceState::Failed);
                warn!(sequence = %sequence.name, "sequence failed: {e}");
            }
        }
    }

    /// Run the children of `parent` (the top level when empty).
    fn run_steps(
        self: &Arc<Self>,
        parent: Vec<usize>,
        stop_on_error: bool,
    ) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let top_level = parent.is_empty();
            let mut index = if top_level {
                self.lock_sequence().current_command_index
            } else {
                0
            };
            loop {
                self.wait_while_paused().await;

                let mut path = parent.clone();
                path.push(index);
                let (name, status) = {
                    let mut sequence = self.lock_sequence();
                    let Some(step) = sequence.step_at(&path) else { break };
                    let found = (step.name.clone(), step.status);
                    if top_level {
                        sequence.current_command_index = index;
                    }
                    found
                };

                if status == StepStatus::Completed {
                    debug!(step = %name, "already completed, skipping");
                } else if let Err(error) = self.run_step(&path).await {
                    if stop_on_error {
                        return Err(format!("step '{name}' failed: {error}"));
                    }
                    warn!(step = %name, "step failed, continuing: {error}");
                }
                index += 1;
            }
            if top_level {
                self.lock_sequence().current_command_index = index;
            }
            Ok(())
        })
    }

    async fn run_step(self: &Arc<Self>, path: &[usize]) -> Result<(), String> {
        let work = {
            let mut sequence = self.lock_sequence();
            let Some(step) = sequence.step_at_mut(path) else {
                return Ok(());
            };
            step.mark_started();
            debug!(step = %step.name, "step started");
            match &step.action {
                StepAction::Sequence { stop_on_error, .. } => Work::Nested {
                    stop_on_error: *stop_on_error,
                },
                action => Work::Leaf(action.clone()),
            }
        };
        // a pause that landed between the lookup and here
        if *self.paused.borrow() {
            self.update_step(path, |s| s.status = StepStatus::Paused);
        }

        let result = match work {
            Work::Nested { stop_on_error } => self.run_steps(path.to_vec(), stop_on_error).await,
            Work::Leaf(action) => self.perform(&action).await.map_err(|e| e.to_string()),
        };
        match &result {
            Ok(()) => self.update_step(path, |s| s.mark_completed()),
            Err(e) => self.update_step(path, |s| s.mark_failed(e.clone())),
        }
        result
    }

    async fn perform(&self, action: &StepAction) -> Result<(), ScopeError> {
        let context = &self.context;
        match action {
            StepAction::WaitMinutes { minutes } => {
                self.sleep_for(Duration::from_secs_f64(minutes * 60.0)).await;
            }
            StepAction::WaitUntilTime { target_time } => self.sleep_until(*target_time).await,
            StepAction::WaitUntilEvent {
                event,
                latitude,
                longitude,
                elevation,
            } => {
                let site = Site {
                    latitude: *latitude,
                    longitude: *longitude,
                    elevation: *elevation,
                };
                let at = context.clock()?.next_occurrence(*event, &site, Utc::now())?;
                debug!(?event, %at, "waiting for event");
                self.sleep_until(at).await;
            }
            StepAction::GoToTarget {
                ra,
                dec,
                target_name,
            } => {
                let client = context.client()?;
                let command = GotoTarget {
                    target_name: target_name.clone().unwrap_or_else(|| "Target".into()),
                    ra: *ra,
                    dec: *dec,
                };
                let ((arrived, reason), ()) = tokio::try_join!(
                    client.wait_for_event_completion("AutoGoto", context.goto_timeout),
                    async { client.send_and_recv(&command).await?.into_result().map(drop) },
                )?;
                if !arrived {
                    return Err(ScopeError::Other(format!(
                        "goto {} failed: {}",
                        command.target_name,
                        reason.unwrap_or_else(|| "no reason given".into())
                    )));
                }
            }
            StepAction::StartImaging {
                exposure_time,
                gain,
                count,
            } => {
                let imaging = context.imaging()?;
                if let Some(client) = context.client.as_deref() {
                    let millis = (exposure_time * 1000.0).round() as u64;
                    client.send_and_recv(&SetExposure { millis }).await?.into_result()?;
                    client.send_and_recv(&SetGain(*gain)).await?.into_result()?;
                }
                let before = imaging.status().total_frames;
                imaging.start_streaming().await?;
                if let Some(count) = count {
                    let mut status = imaging.status_receiver();
                    while status.borrow_and_update().total_frames < before + count {
                        status.changed().await.map_err(|_| ScopeError::ChannelClosed)?;
                    }
                    imaging.stop_streaming().await?;
                }
            }
            StepAction::StopImaging => context.imaging()?.stop_streaming().await?,
            StepAction::Sequence { .. } => {}
        }
        Ok(())
    }

    // ── Pausable waits ───────────────────────────────────────────

    async fn wait_while_paused(&self) {
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep `duration` of unpaused time.
    async fn sleep_for(&self, duration: Duration) {
        let mut paused = self.paused.subscribe();
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.wait_while_paused().await;
            let _ = paused.borrow_and_update();
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return,
                _ = paused.changed() => {
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }
    }

    /// Sleep until a wall-clock time; pausing only delays the finish past it.
    async fn sleep_until(&self, target: DateTime<Utc>) {
        let mut paused = self.paused.subscribe();
        loop {
            self.wait_while_paused().await;
            let _ = paused.borrow_and_update();
            let Ok(remaining) = (target - Utc::now()).to_std() else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return,
                _ = paused.changed() => {}
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn set_state(&self, sequence: &mut Sequence, state: SequenceState) {
        sequence.state = state;
        self.state.send_replace(state);
    }

    fn update_step(&self, path: &[usize], update: impl FnOnce(&mut Step)) {
        if let Some(step) = self.lock_sequence().step_at_mut(path) {
            update(step);
        }
    }

    fn lock_sequence(&self) -> MutexGuard<'_, Sequence> {
        self.sequence.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskGroup> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(DateTime<Utc>);

    impl EventClock for FixedClock {
        fn next_occurrence(
            &self,
            _event: AstronomicalEvent,
            _site: &Site,
            _after: DateTime<Utc>,
        ) -> Result<DateTime<Utc>, ScopeError> {
            Ok(self.0)
        }
    }

    /// Minutes for a wait of `millis`.
    fn minutes(millis: u64) -> f64 {
        millis as f64 / 60_000.0
    }

    async fn finish(runner: &SequenceRunner) -> SequenceState {
        tokio::time::timeout(Duration::from_secs(5), runner.wait())
            .await
            .expect("timeout")
    }

    #[tokio::test]
    async fn runs_waits_in_order() {
        let sequence = Sequence::new("waits")
            .with_step(Step::wait_minutes("first", minutes(30)))
            .with_step(Step::wait_until(
                "second",
                Utc::now() + chrono::Duration::milliseconds(50),
            ))
            .with_step(Step::wait_until("past", Utc::now() - chrono::Duration::hours(1)));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());

        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Completed);

        let done = runner.sequence();
        assert_eq!(done.current_command_index, 3);
        assert!(done.completed_at.is_some());
        for step in &done.steps {
            assert_eq!(step.status, StepStatus::Completed);
            assert!(step.started_at <= step.completed_at);
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let sequence = Sequence::new("long").with_step(Step::wait_minutes("wait", 10.0));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());
        runner.start().unwrap();
        assert!(matches!(
            runner.start(),
            Err(ScopeError::SequenceState { action: "start", .. })
        ));
        runner.stop().await;
    }

    #[tokio::test]
    async fn pause_holds_the_remaining_wait() {
        let sequence =
            Sequence::new("pausable").with_step(Step::wait_minutes("wait", minutes(200)));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());
        assert!(runner.pause().is_err());

        let started = std::time::Instant::now();
        runner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.pause().unwrap();
        assert_eq!(runner.state(), SequenceState::Paused);
        assert_eq!(runner.sequence().steps[0].status, StepStatus::Paused);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runner.state(), SequenceState::Paused);
        assert_eq!(runner.sequence().steps[0].status, StepStatus::Paused);

        runner.resume().unwrap();
        assert!(runner.resume().is_err());
        assert_eq!(runner.sequence().steps[0].status, StepStatus::Running);
        assert_eq!(finish(&runner).await, SequenceState::Completed);
        assert!(started.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn stop_cancels_the_current_step() {
        let sequence = Sequence::new("stoppable")
            .with_step(Step::wait_minutes("quick", minutes(10)))
            .with_step(Step::group("block", vec![Step::wait_minutes("slow", 10.0)], true));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());
        let mut state = runner.state_receiver();

        runner.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            let slow = || runner.sequence().step_at(&[1, 0]).map(|s| s.status);
            while slow() != Some(StepStatus::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout");

        runner.stop().await;
        assert_eq!(*state.borrow_and_update(), SequenceState::Cancelled);
        let stopped = runner.sequence();
        assert_eq!(stopped.steps[0].status, StepStatus::Completed);
        assert_eq!(stopped.steps[1].status, StepStatus::Cancelled);
        assert_eq!(stopped.step_at(&[1, 0]).unwrap().status, StepStatus::Cancelled);
        assert_eq!(stopped.current_command_index, 1);

        // stopping again changes nothing
        runner.stop().await;
        assert_eq!(runner.state(), SequenceState::Cancelled);
    }

    #[test]
    fn mid_run_document_loads_as_cancelled() {
        let mut sequence = Sequence::new("saved").with_step(Step::wait_minutes("wait", 1.0));
        sequence.state = SequenceState::Running;
        sequence.steps[0].mark_started();

        let runner = SequenceRunner::new(sequence, SequenceContext::new());
        assert_eq!(runner.state(), SequenceState::Cancelled);
        assert_eq!(runner.sequence().steps[0].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_collaborator_fails_the_sequence() {
        let sequence = Sequence::new("needs scope")
            .with_step(Step::goto("slew", 10.0, 20.0, None))
            .with_step(Step::stop_imaging("never"));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());

        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Failed);
        let failed = runner.sequence();
        assert_eq!(failed.steps[0].status, StepStatus::Failed);
        assert!(failed.steps[0].error.as_deref().unwrap().contains("scope client"));
        assert_eq!(failed.steps[1].status, StepStatus::Pending);
        assert_eq!(failed.current_command_index, 0);
    }

    #[tokio::test]
    async fn nested_failure_respects_stop_on_error() {
        let lenient = Step::group(
            "lenient",
            vec![Step::stop_imaging("no imaging"), Step::wait_minutes("after", minutes(10))],
            false,
        );
        let runner =
            SequenceRunner::new(Sequence::new("nested").with_step(lenient), SequenceContext::new());
        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Completed);
        let done = runner.sequence();
        assert_eq!(done.step_at(&[0, 0]).unwrap().status, StepStatus::Failed);
        assert_eq!(done.step_at(&[0, 1]).unwrap().status, StepStatus::Completed);

        let strict = Step::group(
            "strict",
            vec![Step::stop_imaging("no imaging"), Step::wait_minutes("after", minutes(10))],
            true,
        );
        let runner =
            SequenceRunner::new(Sequence::new("nested").with_step(strict), SequenceContext::new());
        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Failed);
        let failed = runner.sequence();
        let outer = &failed.steps[0];
        assert_eq!(outer.status, StepStatus::Failed);
        assert!(outer.error.as_deref().unwrap().starts_with("step 'no imaging' failed"));
        assert_eq!(failed.step_at(&[0, 1]).unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn restart_skips_completed_steps() {
        let sequence = Sequence::new("retry")
            .with_step(Step::wait_minutes("done", minutes(10)))
            .with_step(Step::stop_imaging("needs imaging"));
        let runner = SequenceRunner::new(sequence, SequenceContext::new());
        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Failed);
        let first_finish = runner.sequence().steps[0].completed_at;

        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Failed);
        let again = runner.sequence();
        assert_eq!(again.steps[0].completed_at, first_finish);
        assert_eq!(again.current_command_index, 1);
    }

    #[tokio::test]
    async fn event_wait_uses_the_clock() {
        let site = Site {
            latitude: 51.5,
            longitude: -0.1,
            elevation: 0.0,
        };
        let step = Step::wait_for_event("dusk", AstronomicalEvent::AstronomicalDusk, site);

        let runner = SequenceRunner::new(
            Sequence::new("no clock").with_step(step.clone()),
            SequenceContext::new(),
        );
        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Failed);

        let clock = Arc::new(FixedClock(Utc::now() + chrono::Duration::milliseconds(50)));
        let runner = SequenceRunner::new(
            Sequence::new("clock").with_step(step),
            SequenceContext::new().with_clock(clock),
        );
        runner.start().unwrap();
        assert_eq!(finish(&runner).await, SequenceState::Completed);
    }
}
