//! Poll loop - drives one observation pass at a time
//!
//! Each pass reads the histograms the current mode needs, folds them into the
//! running total, diffs hang entries, and only then notifies. Passes never
//! overlap: the next one is scheduled after the current one completes, and
//! commands are applied between passes.
//!
//! Clearing after startup or a mode switch is deferred to the first pass that
//! actually reads data, so the badge always starts from the counts present at
//! that moment.

use crate::domain::types::{Badge, HangRecord, Histogram, Mode, SourceId, Threshold, Warning};
use crate::infra::config::{validate_threshold, Config, ModeProfile, ModesConfig};
use crate::infra::error::SourceError;
use crate::infra::metrics::Metrics;
use crate::io::notify_channel::{Clipboard, Notification, Notifier};
use crate::io::source::HistogramSource;
use crate::services::counter::CounterStateMachine;
use crate::services::hang_diff::{HangBatch, HangDiffEngine};
use crate::services::subordinate_cache::SubordinateCache;
use crate::services::threshold::QualifyingTotals;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Transient failures in a row before the user sees a warning
pub const TRANSIENT_FAILURES_BEFORE_WARNING: u32 = 3;

/// User commands accepted between passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Takes effect at the start of the next pass, followed by a deferred clear
    SetMode(Mode),
    /// Values below 1 fall back to the default
    SetThreshold(i64),
    SetPlaySound(bool),
    ClearCount,
    CopyToClipboard(String),
    /// Hangs the user has already seen elsewhere
    ObservedHangs(u64),
}

/// Cloneable sender side of the command channel
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Queue a command without blocking; returns false if it was dropped
    pub fn send(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "command_dropped");
                false
            }
        }
    }

    pub fn set_mode(&self, mode: Mode) -> bool {
        self.send(Command::SetMode(mode))
    }

    pub fn set_threshold(&self, threshold: i64) -> bool {
        self.send(Command::SetThreshold(threshold))
    }

    pub fn set_play_sound(&self, play_sound: bool) -> bool {
        self.send(Command::SetPlaySound(play_sound))
    }

    pub fn clear_count(&self) -> bool {
        self.send(Command::ClearCount)
    }

    pub fn copy_to_clipboard(&self, text: impl Into<String>) -> bool {
        self.send(Command::CopyToClipboard(text.into()))
    }

    pub fn observed_hangs(&self, count: u64) -> bool {
        self.send(Command::ObservedHangs(count))
    }
}

/// Create a command channel pair
pub fn command_channel(buffer_size: usize) -> (EngineHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EngineHandle::new(tx), rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Diffing,
    Failed,
}

/// What a single pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Data was read and applied; `reset` marks a deferred clear
    Observed { added: u64, new_hangs: u64, reset: bool },
    /// The host does not provide what this mode reads
    Unavailable { warning: Warning },
    /// Transient failure; state is untouched until the next pass. `warning`
    /// is what the user sees once failures persist.
    Failed { warning: Warning },
}

/// User-adjustable settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub mode: Mode,
    pub threshold: u64,
    pub play_sound: bool,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self { mode: config.mode(), threshold: config.threshold(), play_sound: config.play_sound() }
    }
}

#[derive(Default)]
struct PassSnapshot {
    histograms: Vec<(SourceId, Histogram)>,
    hang_batches: Vec<HangBatch>,
}

enum FetchFailure {
    Unavailable(Warning, SourceError),
    Transient(Warning, SourceError),
}

impl FetchFailure {
    fn classify(warning: Warning, error: SourceError) -> Self {
        if error.is_permanent() {
            FetchFailure::Unavailable(warning, error)
        } else {
            FetchFailure::Transient(warning, error)
        }
    }
}

pub struct PollLoop {
    source: Arc<dyn HistogramSource>,
    notifier: Arc<dyn Notifier>,
    clipboard: Arc<dyn Clipboard>,
    metrics: Arc<Metrics>,
    profiles: ModesConfig,
    settings: Settings,
    pending_mode: Option<Mode>,
    pending_clear: bool,
    state: PollState,
    totals: QualifyingTotals,
    diff: HangDiffEngine,
    counter: CounterStateMachine,
    cache: SubordinateCache,
    fetch_timeout: Duration,
    poll_interval: Duration,
    warning: Option<Warning>,
    transient_failures: u32,
    /// Last computed threshold sent out; outer `None` means never sent
    computed_threshold: Option<Option<u64>>,
}

impl PollLoop {
    pub fn new(
        config: &Config,
        source: Arc<dyn HistogramSource>,
        notifier: Arc<dyn Notifier>,
        clipboard: Arc<dyn Clipboard>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            notifier,
            clipboard,
            metrics,
            profiles: config.modes().clone(),
            settings: Settings::from_config(config),
            pending_mode: None,
            pending_clear: true,
            state: PollState::Idle,
            totals: QualifyingTotals::new(),
            diff: HangDiffEngine::new(config.history_capacity()),
            counter: CounterStateMachine::new(),
            cache: SubordinateCache::new(config.subordinate_cache_ttl()),
            fetch_timeout: config.fetch_timeout(),
            poll_interval: config.poll_interval(),
            warning: None,
            transient_failures: 0,
            computed_threshold: None,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn badge(&self) -> Badge {
        self.counter.observed_badge()
    }

    pub fn raw_total(&self) -> u64 {
        self.counter.raw_total()
    }

    pub fn recent_hangs(&self) -> Vec<HangRecord> {
        self.diff.history()
    }

    pub fn warning(&self) -> Option<Warning> {
        self.warning
    }

    pub fn clear_pending(&self) -> bool {
        self.pending_clear
    }

    /// Run passes until shutdown, applying commands while idle
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        info!(
            mode = %self.settings.mode,
            threshold = %self.settings.threshold,
            interval_ms = %self.poll_interval.as_millis(),
            "poll_loop_started"
        );
        let mut commands_open = true;

        loop {
            let outcome = self.poll_once().await;
            trace!(?outcome, "poll_complete");

            let sleep = tokio::time::sleep(self.poll_interval);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv(), if commands_open => match command {
                        Some(command) => self.apply_command(command),
                        None => {
                            debug!("command_channel_closed");
                            commands_open = false;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("poll_loop_shutdown");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Execute one pass; failures are absorbed into the outcome
    pub async fn poll_once(&mut self) -> PollOutcome {
        let started = Instant::now();
        self.apply_pending_mode();

        let mode = self.settings.mode;
        let profile = self.profiles.profile(mode).clone();
        let threshold = profile.threshold(self.settings.threshold);

        self.state = PollState::Fetching;
        let outcome = match self.fetch(mode, &profile).await {
            Ok(snapshot) => {
                self.state = PollState::Diffing;
                self.apply(snapshot, &threshold)
            }
            Err(failure) => {
                self.state = PollState::Failed;
                self.fail(failure)
            }
        };

        let failed = !matches!(outcome, PollOutcome::Observed { .. });
        self.metrics.record_poll(started.elapsed().as_micros() as u64, failed);
        self.state = PollState::Idle;
        outcome
    }

    /// Apply a command immediately
    pub fn apply_command(&mut self, command: Command) {
        match command {
            Command::SetMode(mode) => {
                info!(current = %self.settings.mode, requested = %mode, "mode_change_requested");
                self.pending_mode = Some(mode);
            }
            Command::SetThreshold(threshold) => {
                self.settings.threshold = validate_threshold(threshold);
                info!(threshold = %self.settings.threshold, "threshold_changed");
            }
            Command::SetPlaySound(play_sound) => {
                self.settings.play_sound = play_sound;
                info!(play_sound = %play_sound, "play_sound_changed");
            }
            Command::ClearCount => self.clear_count(),
            Command::CopyToClipboard(text) => {
                if let Err(e) = self.clipboard.set_text(&text) {
                    warn!(error = %format!("{:#}", e), "clipboard_copy_failed");
                }
            }
            Command::ObservedHangs(count) => {
                let update = self.counter.add_observed(count);
                if update.changed {
                    self.notifier.notify(Notification::badge(update.badge));
                }
            }
        }
    }

    fn clear_count(&mut self) {
        let badge = self.counter.clear();
        self.diff.clear_history();
        self.metrics.record_clear();
        info!(raw_total = %self.counter.raw_total(), "count_cleared");

        self.notifier.notify(Notification::StateReset);
        self.notifier.notify(Notification::badge(badge));
        self.notifier.notify(Notification::RecentHangs { recent_hangs: Vec::new() });
    }

    fn apply_pending_mode(&mut self) {
        let Some(mode) = self.pending_mode.take() else {
            return;
        };
        if mode == self.settings.mode {
            return;
        }

        info!(from = %self.settings.mode, to = %mode, "mode_switched");
        self.settings.mode = mode;
        self.totals.reset_baselines();
        self.cache.invalidate();
        self.computed_threshold = None;
        self.pending_clear = true;
        self.metrics.record_mode_switch();
    }

    async fn fetch(&mut self, mode: Mode, profile: &ModeProfile) -> Result<PassSnapshot, FetchFailure> {
        let name = profile.histogram.as_str();
        let mut snapshot = PassSnapshot::default();

        if mode.reads_main() {
            let histogram = self
                .source
                .histogram(name)
                .map_err(|e| FetchFailure::classify(mode.unavailable_warning(), e))?;
            snapshot.histograms.push((SourceId::Main, histogram));

            if mode.tracks_hang_entries() {
                match self.source.hang_entries(name) {
                    Ok(entries) => snapshot.hang_batches.push((SourceId::Main, entries)),
                    Err(e) => debug!(error = %e, "hang_entries_unavailable"),
                }
            }
        }

        if mode.reads_subordinates() {
            let bundles = self
                .cache
                .fetch(self.source.as_ref(), self.fetch_timeout, &self.metrics)
                .await
                .map_err(|e| FetchFailure::classify(Warning::UnavailableSubordinateSource, e))?;

            for bundle in bundles.iter() {
                let source = SourceId::Subordinate(bundle.process_id.clone());
                match bundle.histograms.get(name) {
                    Some(histogram) => snapshot.histograms.push((source.clone(), histogram.clone())),
                    None => trace!(source = %source, histogram = %name, "subordinate_histogram_missing"),
                }
                if mode.tracks_hang_entries() {
                    // An empty batch still marks the process as alive
                    let entries = bundle.hang_entries.get(name).cloned().unwrap_or_default();
                    snapshot.hang_batches.push((source, entries));
                }
            }
        }

        Ok(snapshot)
    }

    fn apply(&mut self, snapshot: PassSnapshot, threshold: &Threshold) -> PollOutcome {
        let seed = self.pending_clear;
        let readings: Vec<(SourceId, &Histogram)> =
            snapshot.histograms.iter().map(|(source, h)| (source.clone(), h)).collect();
        let observation = self.totals.observe(&readings, threshold, seed);
        self.metrics.record_qualifying(observation.added);

        let mut repairs = observation.repairs;
        let mut new_hangs = 0;
        let mut history = None;
        if seed {
            self.diff.prime(&snapshot.hang_batches);
        } else {
            let pass = self.diff.diff(&snapshot.hang_batches, threshold, Utc::now());
            repairs += pass.repairs;
            new_hangs = pass.added;
            if pass.added > 0 {
                history = Some(pass.records);
            }
        }
        self.metrics.record_hangs(new_hangs);
        self.metrics.record_malformed(repairs);

        if seed {
            self.pending_clear = false;
            let badge = self.counter.reset_to(observation.total);
            self.diff.clear_history();
            self.metrics.record_clear();
            info!(mode = %self.settings.mode, raw_total = %observation.total, "deferred_clear_applied");

            self.notifier.notify(Notification::StateReset);
            self.notifier.notify(Notification::badge(badge));
            self.notifier.notify(Notification::RecentHangs { recent_hangs: Vec::new() });
        } else {
            let update = self.counter.on_new_total(Some(observation.total));
            if update.changed {
                self.notifier.notify(Notification::badge(update.badge));
            }
            if let Some(delta) = update.increased_by {
                info!(badge = %update.badge, delta = %delta, new_hangs = %new_hangs, "hang_count_increased");
                if self.settings.play_sound {
                    self.notifier.notify(Notification::Blip { delta });
                }
            }
            if let Some(records) = history {
                self.notifier.notify(Notification::RecentHangs { recent_hangs: records });
            }
        }

        if self.computed_threshold != Some(observation.computed_threshold) {
            self.computed_threshold = Some(observation.computed_threshold);
            self.notifier.notify(Notification::ComputedThreshold {
                computed_threshold: observation.computed_threshold,
            });
        }
        self.transient_failures = 0;
        self.set_warning(None);

        PollOutcome::Observed { added: observation.added, new_hangs, reset: seed }
    }

    fn fail(&mut self, failure: FetchFailure) -> PollOutcome {
        match failure {
            FetchFailure::Unavailable(warning, error) => {
                debug!(mode = %self.settings.mode, error = %error, "histogram_source_unavailable");
                self.metrics.record_source_unavailable();
                self.transient_failures = 0;
                let update = self.counter.on_new_total(None);
                if update.changed {
                    self.notifier.notify(Notification::badge(update.badge));
                }
                self.set_warning(Some(warning));
                PollOutcome::Unavailable { warning }
            }
            FetchFailure::Transient(warning, error) => {
                self.transient_failures = self.transient_failures.saturating_add(1);
                warn!(
                    mode = %self.settings.mode,
                    error = %error,
                    kind = %error.kind(),
                    consecutive = %self.transient_failures,
                    "poll_fetch_failed"
                );
                if self.transient_failures >= TRANSIENT_FAILURES_BEFORE_WARNING {
                    self.set_warning(Some(warning));
                }
                PollOutcome::Failed { warning }
            }
        }
    }

    fn set_warning(&mut self, warning: Option<Warning>) {
        if self.warning == warning {
            return;
        }
        match warning {
            Some(w) => warn!(warning = %w.as_str(), "warning_raised"),
            None => info!("warning_cleared"),
        }
        self.warning = warning;
        self.notifier.notify(Notification::Warning { warning });
    }
}
