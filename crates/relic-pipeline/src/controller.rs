//! Run controller: sequences the four stages, tracks progress, and
//! supports pause, resume and cancel from any thread.
//!
//! The controller drives the same typed chain as [`crate::Pipeline`]
//! and checks its status between the calls. Pause and cancel are
//! cooperative: a running stage always finishes before either takes
//! effect.
//!
//! All methods take `&self`. State lives behind mutexes that are never
//! held while a stage or an event handler runs, so a handler may call
//! back into the controller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::diagnostics::StageMetrics;
use crate::error::{PipelineError, StageError};
use crate::events::{EventBus, EventKind, HandlerError, PipelineEvent, SubscriptionId};
use crate::ingest::IngestInput;
use crate::output::RestoredImage;
use crate::pipeline::{Pipeline, PipelineStage, Progress, StageId};

// ────────────────────────────── Status ──────────────────────────────

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No run has started.
    #[default]
    Idle,
    /// A stage is running or about to run.
    Processing,
    /// Waiting at a stage boundary.
    Paused,
    /// The last run produced a result.
    Complete,
    /// The last run failed.
    Error,
    /// The last run was cancelled.
    Cancelled,
}

/// Inputs to [`Status::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// `process` was called.
    Start,
    /// `pause` was called.
    Pause,
    /// `resume` was called.
    Resume,
    /// `cancel` was called.
    Cancel,
    /// The last stage finished.
    Finish,
    /// A stage failed.
    Fail,
}

impl Status {
    /// The state reached by applying `event`, or `None` when the event
    /// is not valid here.
    #[must_use]
    pub const fn transition(self, event: ControlEvent) -> Option<Self> {
        match (self, event) {
            (Self::Idle | Self::Complete | Self::Error | Self::Cancelled, ControlEvent::Start)
            | (Self::Paused, ControlEvent::Resume) => Some(Self::Processing),
            (Self::Processing, ControlEvent::Pause) => Some(Self::Paused),
            (Self::Processing | Self::Paused, ControlEvent::Cancel) => Some(Self::Cancelled),
            (Self::Processing, ControlEvent::Finish) => Some(Self::Complete),
            (Self::Processing | Self::Paused, ControlEvent::Fail) => Some(Self::Error),
            _ => None,
        }
    }

    /// `true` while a run is in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Processing | Self::Paused)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ───────────────────────────── Progress ─────────────────────────────

/// Snapshot returned by [`Controller::get_progress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    /// The stage running or last run.
    pub current_stage: Option<StageId>,
    /// Stage-local percentage, 0–100.
    pub stage_progress: f64,
    /// Weighted overall percentage, 0–100.
    pub overall_progress: f64,
    /// Controller status.
    pub status: Status,
    /// `elapsed * (100 - overall) / overall`, absent while overall is 0.
    #[serde(with = "option_duration_serde")]
    pub estimated_time_remaining: Option<Duration>,
}

mod option_duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Default)]
struct RunState {
    status: Status,
    /// Generation of the latest run; bumped by every accepted start.
    run: u64,
    /// A run is executing, whatever `status` says. A cancelled run stays
    /// in flight until it reaches its next stage boundary.
    in_flight: bool,
    current_stage: Option<StageId>,
    stage_progress: f64,
    completed: Vec<StageId>,
    started_at: Option<Duration>,
    finished_at: Option<Duration>,
    last_progress_event: Option<Duration>,
    results: BTreeMap<StageId, StageMetrics>,
}

// ──────────────────────────── Controller ────────────────────────────

/// Sequences the pipeline stages and exposes run control.
pub struct Controller {
    config: Mutex<PipelineConfig>,
    state: Mutex<RunState>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.status())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// A controller using the wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` fails
    /// validation.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// A controller using `clock` for progress throttling, ETA and the
    /// pause poll loop.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` fails
    /// validation.
    pub fn with_clock(config: PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Mutex::new(config),
            state: Mutex::new(RunState::default()),
            events: EventBus::new(),
            clock,
        })
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The event registry.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shorthand for [`EventBus::subscribe`].
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    /// Shorthand for [`EventBus::unsubscribe`].
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.state().status
    }

    /// A copy of the configuration.
    #[must_use]
    pub fn get_config(&self) -> PipelineConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Edit a copy of the configuration and swap it in if it validates.
    /// A run in flight keeps the configuration it started with.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] and leaves the current
    /// configuration untouched if the edited copy is inconsistent.
    pub fn update_config(&self, edit: impl FnOnce(&mut PipelineConfig)) -> Result<(), PipelineError> {
        let mut next = self.get_config();
        edit(&mut next);
        next.validate()?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// Apply `event` under the state lock. Returns the new status when
    /// the transition was valid.
    fn apply(&self, event: ControlEvent) -> Option<Status> {
        let mut state = self.state();
        let next = state.status.transition(event)?;
        state.status = next;
        if !next.is_active() {
            state.finished_at = Some(self.clock.now());
        }
        Some(next)
    }

    /// Suspend at the next stage boundary. No-op unless processing.
    pub fn pause(&self) -> bool {
        let paused = self.apply(ControlEvent::Pause).is_some();
        if paused {
            tracing::info!("pipeline paused");
            self.events.emit(&PipelineEvent::Paused);
        }
        paused
    }

    /// Continue a paused run. No-op unless paused.
    pub fn resume(&self) -> bool {
        let resumed = self.apply(ControlEvent::Resume).is_some();
        if resumed {
            tracing::info!("pipeline resumed");
            self.events.emit(&PipelineEvent::Resumed);
        }
        resumed
    }

    /// Stop the run at the next stage boundary. No-op unless processing
    /// or paused.
    ///
    /// The status reads [`Status::Cancelled`] straight away, but the run
    /// stays in flight until the current stage returns; a
    /// [`Controller::process`] call in that window still fails with
    /// [`PipelineError::AlreadyProcessing`].
    pub fn cancel(&self) -> bool {
        let cancelled = self.apply(ControlEvent::Cancel).is_some();
        if cancelled {
            tracing::info!("pipeline cancel requested");
        }
        cancelled
    }

    /// Weighted progress of the current or last run.
    #[must_use]
    pub fn get_progress(&self) -> PipelineProgress {
        let weights = self.get_config().pipeline.stage_weights;
        let now = self.clock.now();
        let state = self.state();
        let done: f64 = state.completed.iter().map(|&s| weights.weight(s)).sum();
        let current = state
            .current_stage
            .filter(|s| !state.completed.contains(s))
            .map_or(0.0, |s| weights.weight(s) * state.stage_progress);
        let overall = done.mul_add(100.0, current).clamp(0.0, 100.0);
        let elapsed = state
            .started_at
            .map(|start| state.finished_at.unwrap_or(now).saturating_sub(start));
        let estimated_time_remaining = match elapsed {
            Some(elapsed) if overall > 0.0 => {
                Some(elapsed.mul_f64((100.0 - overall) / overall))
            }
            _ => None,
        };
        PipelineProgress {
            current_stage: state.current_stage,
            stage_progress: state.stage_progress,
            overall_progress: overall,
            status: state.status,
            estimated_time_remaining,
        }
    }

    /// Summary of a stage of the current or last run, once that stage
    /// has completed.
    #[must_use]
    pub fn get_stage_result(&self, stage: StageId) -> Option<StageMetrics> {
        self.state().results.get(&stage).cloned()
    }

    /// Run all four stages over `input`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::AlreadyProcessing`] if a run is in flight,
    ///   including a cancelled run that has not reached its stage
    ///   boundary yet; that run is not disturbed.
    /// - [`PipelineError::Validation`] if file-level validation fails.
    /// - [`PipelineError::Stage`] if a stage fails.
    /// - [`PipelineError::Cancelled`] if [`Controller::cancel`] was
    ///   called.
    pub fn process(&self, input: IngestInput) -> Result<RestoredImage, PipelineError> {
        let started = self.clock.now();
        let id = {
            let mut state = self.state();
            let next = state
                .status
                .transition(ControlEvent::Start)
                .filter(|_| !state.in_flight);
            let Some(next) = next else {
                return Err(PipelineError::AlreadyProcessing);
            };
            let id = state.run.wrapping_add(1);
            *state = RunState {
                status: next,
                run: id,
                in_flight: true,
                started_at: Some(started),
                ..RunState::default()
            };
            id
        };
        let _in_flight = InFlight {
            controller: self,
            run: id,
        };
        let config = self.get_config();
        tracing::info!(
            bytes = input.bytes.len(),
            filename = input.filename.as_deref().unwrap_or(""),
            "pipeline started"
        );

        let run = Run {
            controller: self,
            config,
            started,
        };
        let outcome = run.execute(input);
        self.finish(id, outcome)
    }

    /// End run `id`: apply `event` (if any), stamp the finish time and
    /// clear the in-flight flag. Returns `false` when `event` was not a
    /// valid transition.
    fn conclude(&self, id: u64, event: Option<ControlEvent>) -> bool {
        let mut state = self.state();
        let applied = match event {
            Some(event) => match state.status.transition(event) {
                Some(next) => {
                    state.status = next;
                    true
                }
                None => false,
            },
            None => true,
        };
        if state.run == id {
            state.in_flight = false;
            state.finished_at = Some(self.clock.now());
        }
        applied
    }

    /// Settle the status and emit the terminal event. The in-flight flag
    /// is cleared first, so terminal handlers may start the next run.
    fn finish(
        &self,
        id: u64,
        outcome: Result<RestoredImage, PipelineError>,
    ) -> Result<RestoredImage, PipelineError> {
        match outcome {
            Ok(result) => {
                if !self.conclude(id, Some(ControlEvent::Finish)) {
                    // cancelled after the last boundary check
                    tracing::info!("pipeline cancelled");
                    self.events.emit(&PipelineEvent::PipelineCancel);
                    return Err(PipelineError::Cancelled);
                }
                tracing::info!(
                    width = result.width,
                    height = result.height,
                    improvement = result.report.improvement,
                    "pipeline complete"
                );
                self.events.emit(&PipelineEvent::PipelineComplete {
                    report: result.report.clone(),
                    timings: result.report.timings,
                });
                Ok(result)
            }
            Err(PipelineError::Cancelled) => {
                self.conclude(id, None);
                tracing::info!("pipeline cancelled");
                self.events.emit(&PipelineEvent::PipelineCancel);
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.conclude(id, Some(ControlEvent::Fail));
                tracing::warn!(error = %e, "pipeline failed");
                self.events.emit(&PipelineEvent::PipelineError {
                    error: e.to_string(),
                    stage: e.stage(),
                });
                Err(e)
            }
        }
    }

    /// Record stage-local progress and decide whether to notify.
    fn report_progress(&self, stage: StageId, percent: f64, message: &str, interval: Duration) {
        let now = self.clock.now();
        let notify = {
            let mut state = self.state();
            state.stage_progress = percent.clamp(0.0, 100.0);
            let due = state
                .last_progress_event
                .is_none_or(|last| now.saturating_sub(last) >= interval);
            let notify = due || percent <= 0.0 || percent >= 100.0;
            if notify {
                state.last_progress_event = Some(now);
            }
            notify
        };
        if notify {
            self.events.emit(&PipelineEvent::StageProgress {
                stage,
                percent,
                message: message.to_string(),
            });
        }
    }
}

// ──────────────────────────────── Run ───────────────────────────────

/// Clears the in-flight flag of run `run` if it is still set when
/// `process` unwinds.
struct InFlight<'a> {
    controller: &'a Controller,
    run: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.state();
        if state.run == self.run {
            state.in_flight = false;
        }
    }
}

/// One invocation of [`Controller::process`].
struct Run<'a> {
    controller: &'a Controller,
    config: PipelineConfig,
    started: Duration,
}

impl Run<'_> {
    fn execute(&self, input: IngestInput) -> Result<RestoredImage, PipelineError> {
        let validated = Pipeline::new(input, self.config.clone())
            .validate()
            .map_err(|e| {
                for warning in &e.warnings {
                    tracing::warn!(%warning, "validation warning");
                }
                PipelineError::Validation(e)
            })?;
        for warning in &validated.check().warnings {
            tracing::warn!(%warning, "validation warning");
        }

        let ingested = self.stage(StageId::Ingestion, |p| validated.ingest_with(p))?;
        let detected = self.stage(StageId::Detection, |p| Ok(ingested.detect_with(p)))?;
        let segmented = self.stage(StageId::Segmentation, |p| Ok(detected.segment_with(p)))?;
        let restored = self.stage(StageId::Restoration, |p| segmented.restore_with(p))?;
        self.boundary()?;
        Ok(restored.into_result())
    }

    /// Wait out a pause, then fail if the run was cancelled.
    fn boundary(&self) -> Result<(), PipelineError> {
        let poll = self.config.pipeline.pause_poll_interval();
        loop {
            match self.controller.status() {
                Status::Cancelled => return Err(PipelineError::Cancelled),
                Status::Paused => self.controller.clock.sleep(poll),
                _ => return Ok(()),
            }
        }
    }

    fn stage<T: PipelineStage>(
        &self,
        stage: StageId,
        run: impl FnOnce(Progress<'_>) -> Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        self.boundary()?;
        let c = self.controller;
        {
            let mut state = c.state();
            state.current_stage = Some(stage);
            state.stage_progress = 0.0;
            state.last_progress_event = None;
        }
        tracing::debug!(%stage, "stage started");
        c.events.emit(&PipelineEvent::StageStart { stage });

        let stage_start = c.clock.now();
        let interval = self.config.pipeline.progress_interval();
        let mut progress = |percent: f64, message: &str| {
            c.report_progress(stage, percent, message, interval);
        };
        match run(&mut progress) {
            Ok(next) => {
                let duration = c.clock.now().saturating_sub(stage_start);
                let metrics = next.metrics();
                {
                    let mut state = c.state();
                    state.completed.push(stage);
                    state.stage_progress = 100.0;
                    if let Some(m) = &metrics {
                        state.results.insert(stage, m.clone());
                    }
                }
                tracing::debug!(%stage, ?duration, "stage complete");
                if let Some(metrics) = metrics {
                    c.events.emit(&PipelineEvent::StageComplete {
                        stage,
                        duration,
                        metrics,
                    });
                }
                Ok(next)
            }
            Err(source) => {
                let elapsed = c.clock.now().saturating_sub(self.started);
                tracing::warn!(%stage, error = %source, "stage failed");
                c.events.emit(&PipelineEvent::StageError {
                    stage,
                    error: source.to_string(),
                });
                Err(PipelineError::Stage {
                    stage,
                    elapsed,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{ImageEncoder, Rgba, RgbaImage};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RestorationConfig;
    use crate::segment::SegmentStrategyKind;

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, Rgba([128, 128, 128, 255]));
        let mut buf = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), w, h, image::ExtendedColorType::Rgba8)
            .unwrap();
        buf
    }

    fn config() -> PipelineConfig {
        let mut c = PipelineConfig::default();
        c.segmentation.strategy = SegmentStrategyKind::Grid;
        c.segmentation.max_shards = 4;
        c.restoration = RestorationConfig::neutral();
        c
    }

    fn controller() -> (Arc<Controller>, ManualClock) {
        let clock = ManualClock::new();
        let c = Controller::with_clock(config(), Arc::new(clock.clone())).unwrap();
        (Arc::new(c), clock)
    }

    fn collect(c: &Controller, kind: EventKind) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.subscribe(kind, move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn transition_table() {
        use ControlEvent::{Cancel, Fail, Finish, Pause, Resume, Start};
        assert_eq!(Status::Idle.transition(Start), Some(Status::Processing));
        assert_eq!(Status::Idle.transition(Pause), None);
        assert_eq!(Status::Idle.transition(Resume), None);
        assert_eq!(Status::Idle.transition(Cancel), None);
        assert_eq!(Status::Processing.transition(Start), None);
        assert_eq!(Status::Paused.transition(Start), None);
        assert_eq!(Status::Processing.transition(Pause), Some(Status::Paused));
        assert_eq!(Status::Processing.transition(Resume), None);
        assert_eq!(Status::Paused.transition(Resume), Some(Status::Processing));
        assert_eq!(Status::Paused.transition(Cancel), Some(Status::Cancelled));
        assert_eq!(Status::Processing.transition(Finish), Some(Status::Complete));
        assert_eq!(Status::Paused.transition(Finish), None);
        assert_eq!(Status::Processing.transition(Fail), Some(Status::Error));
        assert_eq!(Status::Cancelled.transition(Start), Some(Status::Processing));
        assert_eq!(Status::Complete.transition(Cancel), None);
    }

    #[test]
    fn pause_and_resume_while_idle_are_no_ops() {
        let (c, _) = controller();
        assert!(!c.pause());
        assert!(!c.resume());
        assert!(!c.cancel());
        assert_eq!(c.status(), Status::Idle);
        assert_eq!(c.get_progress().overall_progress, 0.0);
        assert!(c.get_progress().estimated_time_remaining.is_none());
    }

    #[test]
    fn completes_and_records_stage_results() {
        let (c, _) = controller();
        let completed = collect(&c, EventKind::StageComplete);
        let done = collect(&c, EventKind::PipelineComplete);
        let result = c.process(IngestInput::new(png(100, 100))).unwrap();
        assert_eq!((result.width, result.height), (100, 100));
        assert_eq!(c.status(), Status::Complete);
        assert_eq!(completed.lock().unwrap().len(), 4);
        assert_eq!(done.lock().unwrap().len(), 1);

        let progress = c.get_progress();
        assert!((progress.overall_progress - 100.0).abs() < 1e-9);
        assert_eq!(progress.current_stage, Some(StageId::Restoration));
        assert!(matches!(
            c.get_stage_result(StageId::Segmentation),
            Some(StageMetrics::Segmentation { shard_count: 4, .. })
        ));
    }

    #[test]
    fn cancel_from_a_handler_stops_at_the_next_boundary() {
        let (c, _) = controller();
        let weak: Weak<Controller> = Arc::downgrade(&c);
        c.subscribe(EventKind::StageStart, move |e| {
            if let PipelineEvent::StageStart {
                stage: StageId::Detection,
            } = e
            {
                weak.upgrade().expect("controller alive").cancel();
            }
            Ok(())
        });
        let cancels = collect(&c, EventKind::PipelineCancel);
        let completed = collect(&c, EventKind::StageComplete);

        let err = c.process(IngestInput::new(png(64, 64))).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(c.status(), Status::Cancelled);
        assert_eq!(cancels.lock().unwrap().len(), 1);
        // detection still runs to completion
        assert_eq!(completed.lock().unwrap().len(), 2);
        assert!(c.get_stage_result(StageId::Segmentation).is_none());
    }

    #[test]
    fn process_is_rejected_while_a_cancelled_run_is_still_in_flight() {
        let (c, _) = controller();
        let weak = Arc::downgrade(&c);
        let nested = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&nested);
        c.subscribe(EventKind::StageStart, move |e| {
            if matches!(e, PipelineEvent::StageStart { stage: StageId::Detection }) {
                let c = weak.upgrade().expect("controller alive");
                assert!(c.cancel());
                let outcome = c.process(IngestInput::new(png(32, 32)));
                *slot.lock().unwrap() = Some(matches!(outcome, Err(PipelineError::AlreadyProcessing)));
            }
            Ok(())
        });
        let completed = collect(&c, EventKind::StageComplete);

        let err = c.process(IngestInput::new(png(64, 64))).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(*nested.lock().unwrap(), Some(true));
        assert_eq!(c.status(), Status::Cancelled);
        // the cancelled run still stopped at the boundary after detection
        assert_eq!(completed.lock().unwrap().len(), 2);
        assert!(c.get_stage_result(StageId::Segmentation).is_none());
    }

    #[test]
    fn completion_handler_may_start_the_next_run() {
        let (c, _) = controller();
        let weak = Arc::downgrade(&c);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let rerun = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&rerun);
        c.subscribe(EventKind::PipelineComplete, move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                let c = weak.upgrade().expect("controller alive");
                let outcome = c.process(IngestInput::new(png(32, 32)));
                *slot.lock().unwrap() = Some(outcome.ok().map(|r| r.width));
            }
            Ok(())
        });
        c.process(IngestInput::new(png(48, 48))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*rerun.lock().unwrap(), Some(Some(32)));
        assert_eq!(c.status(), Status::Complete);
    }

    #[test]
    fn cancel_during_restoration_still_cancels() {
        let (c, _) = controller();
        let weak = Arc::downgrade(&c);
        c.subscribe(EventKind::StageStart, move |e| {
            if matches!(e, PipelineEvent::StageStart { stage: StageId::Restoration }) {
                weak.upgrade().expect("controller alive").cancel();
            }
            Ok(())
        });
        let err = c.process(IngestInput::new(png(64, 64))).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn second_process_fails_while_first_proceeds() {
        let (c, _) = controller();
        let weak = Arc::downgrade(&c);
        let nested = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&nested);
        c.subscribe(EventKind::StageStart, move |e| {
            if matches!(e, PipelineEvent::StageStart { stage: StageId::Ingestion }) {
                let c = weak.upgrade().expect("controller alive");
                let outcome = c.process(IngestInput::new(Vec::new()));
                *slot.lock().unwrap() = Some(matches!(outcome, Err(PipelineError::AlreadyProcessing)));
            }
            Ok(())
        });
        assert!(c.process(IngestInput::new(png(32, 32))).is_ok());
        assert_eq!(*nested.lock().unwrap(), Some(true));
        assert_eq!(c.status(), Status::Complete);
    }

    #[test]
    fn pause_waits_on_the_clock_until_resumed() {
        let (c, clock) = controller();
        let weak = Arc::downgrade(&c);
        c.subscribe(EventKind::StageComplete, move |e| {
            if matches!(e, PipelineEvent::StageComplete { stage: StageId::Ingestion, .. }) {
                weak.upgrade().expect("controller alive").pause();
            }
            Ok(())
        });
        let sleeps = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&sleeps);
        let weak = Arc::downgrade(&c);
        clock.on_sleep(move |_| {
            if counted.fetch_add(1, Ordering::SeqCst) == 2 {
                weak.upgrade().expect("controller alive").resume();
            }
        });
        let paused = collect(&c, EventKind::Paused);
        let resumed = collect(&c, EventKind::Resumed);

        c.process(IngestInput::new(png(48, 48))).unwrap();
        assert_eq!(sleeps.load(Ordering::SeqCst), 3);
        assert_eq!(clock.now(), Duration::from_millis(150));
        assert_eq!(paused.lock().unwrap().len(), 1);
        assert_eq!(resumed.lock().unwrap().len(), 1);
        assert_eq!(c.status(), Status::Complete);
    }

    #[test]
    fn progress_events_are_throttled() {
        let (c, _) = controller();
        let events = collect(&c, EventKind::StageProgress);
        c.process(IngestInput::new(png(40, 40))).unwrap();
        let events = events.lock().unwrap();
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(percents.iter().all(|&p| p <= 0.0 || p >= 100.0));
        assert_eq!(percents.iter().filter(|&&p| p >= 100.0).count(), 4);
    }

    #[test]
    fn stage_failures_are_attributed() {
        let (c, _) = controller();
        let errors = collect(&c, EventKind::StageError);
        let mut bytes = png(16, 16);
        bytes.truncate(40);
        let err = c.process(IngestInput::new(bytes)).unwrap_err();
        assert_eq!(err.stage(), Some(StageId::Ingestion));
        assert_eq!(c.status(), Status::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn validation_failures_precede_stages() {
        let (c, _) = controller();
        let starts = collect(&c, EventKind::StageStart);
        let err = c.process(IngestInput::new(Vec::new())).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(starts.lock().unwrap().is_empty());
        assert_eq!(c.status(), Status::Error);
    }

    #[test]
    fn update_config_rejects_invalid_edits() {
        let (c, _) = controller();
        assert!(c.update_config(|cfg| cfg.segmentation.max_shards = 0).is_err());
        assert_eq!(c.get_config().segmentation.max_shards, 4);
        c.update_config(|cfg| cfg.segmentation.max_shards = 9).unwrap();
        assert_eq!(c.get_config().segmentation.max_shards, 9);
    }

    #[test]
    fn eta_tracks_elapsed_time() {
        let (c, clock) = controller();
        let tick = clock.clone();
        c.subscribe(EventKind::StageComplete, move |_| {
            tick.advance(Duration::from_millis(100));
            Ok(())
        });
        c.process(IngestInput::new(png(32, 32))).unwrap();
        let progress = c.get_progress();
        assert_eq!(progress.estimated_time_remaining, Some(Duration::ZERO));
    }
}
