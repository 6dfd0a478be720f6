// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classifies tailed lines as hot or cold and drains them in batches.
//!
//! Every line read by the [`Watcher`] is matched against the hot keywords of
//! its file (case-insensitive), optionally overridden by a classification hook,
//! and inserted into the hot or cold [`Ring`]. The drain loop in
//! [`Scheduler::run`] wakes on either ring's ready signal or on the polling
//! timer, pops a batch and hands it to a [`Submit`] implementation.
//!
//! Inserts never block the watcher thread. A line that finds its ring full is
//! queued to a per-ring overflow task which keeps retrying in arrival order;
//! lines behind it follow the same path until the overflow queue is empty
//! again, so per-file order is kept. The overflow queue holds at most as many
//! lines as the ring itself. Lines that find it full, or that the overflow task
//! cannot insert before shutdown, are dropped and logged.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::Label;
use crate::config::AgentConfig;
use crate::errors::{ConfigError, ShipperError};
use crate::line_buffer::LineHandler;
use crate::ring::{OfferError, Ring};
use crate::watcher::Watcher;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

const COLD_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Final say on a line's label. Receives the lower-cased line and the keyword verdict.
pub type ClassificationHook = Arc<dyn Fn(&str, Label) -> Label + Send + Sync>;

/// One tailed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub filename: String,
    pub length: u64,
    pub data: Vec<u8>,
}

impl LogLine {
    #[must_use]
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self {
            timestamp,
            filename: filename.into(),
            length: data.len() as u64,
            data,
        }
    }
}

/// Receives drained batches. Called sequentially from the drain loop, so
/// implementations may keep mutable state without locking.
#[async_trait]
pub trait Submit: Send {
    async fn submit_hot(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError>;
    async fn submit_cold(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError>;
}

pub type SubmitFuture = Pin<Box<dyn Future<Output = Result<(), ShipperError>> + Send>>;
pub type SubmitFn = Arc<dyn Fn(Vec<LogLine>) -> SubmitFuture + Send + Sync>;

/// [`Submit`] built from two closures.
#[derive(Clone)]
pub struct SubmitOperations {
    pub hot: SubmitFn,
    pub cold: SubmitFn,
}

#[async_trait]
impl Submit for SubmitOperations {
    async fn submit_hot(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError> {
        (self.hot)(lines).await
    }

    async fn submit_cold(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError> {
        (self.cold)(lines).await
    }
}

/// Result of a best-effort insert. Never surfaced as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertOutcome {
    Inserted,
    /// Ring was full (or older lines were still pending); queued for the overflow task.
    Deferred,
    /// Ring closed or overflow queue full.
    Dropped,
}

struct LineClassifier {
    matchers: HashMap<String, Option<Regex>>,
    hook: Option<ClassificationHook>,
}

impl LineClassifier {
    fn new(config: &AgentConfig, hook: Option<ClassificationHook>) -> Result<Self, ConfigError> {
        let mut matchers = HashMap::with_capacity(config.files.len());
        for file in &config.files {
            matchers.insert(file.filename.clone(), build_matcher(&file.hot_filter)?);
        }
        Ok(Self { matchers, hook })
    }

    fn classify(&self, filename: &str, line: &str) -> Result<Label, ShipperError> {
        let matcher = self
            .matchers
            .get(filename)
            .ok_or_else(|| ShipperError::UnknownFile(filename.to_string()))?;
        let lowered = line.to_lowercase();
        let verdict = match matcher {
            Some(re) if re.is_match(&lowered) => Label::Hot,
            _ => Label::Cold,
        };
        Ok(match &self.hook {
            Some(hook) => hook(&lowered, verdict),
            None => verdict,
        })
    }
}

/// Alternation of the escaped, lower-cased keywords. `None` never matches.
fn build_matcher(keywords: &[String]) -> Result<Option<Regex>, ConfigError> {
    let alternatives: Vec<String> = keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| regex::escape(&k.to_lowercase()))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = alternatives.join("|");
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| ConfigError::Pattern {
            pattern,
            reason: e.to_string(),
        })
}

struct Shared {
    state: AtomicU8,
    cancel: CancellationToken,
    hot: Ring<LogLine>,
    cold: Ring<LogLine>,
    hot_pending: AtomicUsize,
    cold_pending: AtomicUsize,
    watcher: Watcher,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    fn close(&self) {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);
        self.cancel.cancel();
        self.hot.close();
        self.cold.close();
        self.watcher.close();
        if previous != STOPPED {
            info!("Scheduler closed");
        }
    }

    fn ring(&self, label: Label) -> (&Ring<LogLine>, &AtomicUsize) {
        match label {
            Label::Hot => (&self.hot, &self.hot_pending),
            Label::Cold => (&self.cold, &self.cold_pending),
        }
    }

    /// Inserts inline when possible, otherwise hands the line to the overflow task.
    fn insert(&self, label: Label, line: LogLine, overflow: &mpsc::Sender<LogLine>) -> InsertOutcome {
        let (ring, pending) = self.ring(label);
        let line = if pending.load(Ordering::Acquire) == 0 {
            match ring.offer(line) {
                Ok(()) => return InsertOutcome::Inserted,
                Err(OfferError::Full(line)) => line,
                Err(closed) => {
                    let line = closed.into_inner();
                    warn!("Dropped {} line from {}: ring closed", ring.name(), line.filename);
                    return InsertOutcome::Dropped;
                }
            }
        } else {
            line
        };

        pending.fetch_add(1, Ordering::AcqRel);
        match overflow.try_send(line) {
            Ok(()) => InsertOutcome::Deferred,
            Err(e) => {
                pending.fetch_sub(1, Ordering::AcqRel);
                let reason = match &e {
                    mpsc::error::TrySendError::Full(_) => "overflow is full",
                    mpsc::error::TrySendError::Closed(_) => "overflow task is gone",
                };
                warn!(
                    "Dropped {} line from {}: {}",
                    ring.name(),
                    e.into_inner().filename,
                    reason
                );
                InsertOutcome::Dropped
            }
        }
    }

    /// Hot lines wait for space in the ring.
    async fn insert_hot(&self, line: LogLine) -> InsertOutcome {
        match self.hot.push(line).await {
            Ok(()) => InsertOutcome::Inserted,
            Err(_) => InsertOutcome::Dropped,
        }
    }

    /// Cold lines retry while the ring is full, asking the drain loop to empty it
    /// each time `timeout` passes. Gives up once the scheduler stops.
    async fn insert_cold(&self, line: LogLine, timeout: Duration) -> InsertOutcome {
        let mut line = line;
        let mut start = Instant::now();
        loop {
            match self.cold.offer(line) {
                Ok(()) => return InsertOutcome::Inserted,
                Err(OfferError::Closed(_)) => return InsertOutcome::Dropped,
                Err(OfferError::Full(rejected)) => line = rejected,
            }
            if !self.is_running() {
                return InsertOutcome::Dropped;
            }
            if !timeout.is_zero() && start.elapsed() >= timeout {
                debug!("Cold ring still full after {:?}, requesting a drain", timeout);
                self.cold.kick();
                start = Instant::now();
            }
            tokio::time::sleep(COLD_RETRY_DELAY).await;
        }
    }

    async fn run_overflow(
        self: Arc<Self>,
        label: Label,
        mut lines: mpsc::Receiver<LogLine>,
        cold_timeout: Duration,
    ) {
        while let Some(line) = lines.recv().await {
            let filename = line.filename.clone();
            let outcome = match label {
                Label::Hot => self.insert_hot(line).await,
                Label::Cold => self.insert_cold(line, cold_timeout).await,
            };
            let (ring, pending) = self.ring(label);
            pending.fetch_sub(1, Ordering::AcqRel);
            if outcome == InsertOutcome::Dropped {
                warn!("Dropped {} line from {}: scheduler stopped", ring.name(), filename);
            }
        }
    }
}

/// Cloneable view used to observe and stop a running scheduler from other tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Files currently registered with the watcher.
    #[must_use]
    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.shared.watcher.file_names()
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

pub struct Scheduler {
    config: AgentConfig,
    classifier: Arc<LineClassifier>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Validates `config` (expanding file patterns) and prepares the rings and watcher.
    pub fn new(config: &AgentConfig, hook: Option<ClassificationHook>) -> Result<Self, ShipperError> {
        let mut config = config.clone();
        config.resolve()?;
        let classifier = LineClassifier::new(&config, hook)?;

        let shared = Shared {
            state: AtomicU8::new(IDLE),
            cancel: CancellationToken::new(),
            hot: Ring::new(config.hot_ring_capacity, "hot"),
            cold: Ring::new(config.cold_ring_capacity, "cold"),
            hot_pending: AtomicUsize::new(0),
            cold_pending: AtomicUsize::new(0),
            watcher: Watcher::new()?,
        };

        Ok(Self {
            config,
            classifier: Arc::new(classifier),
            shared: Arc::new(shared),
        })
    }

    /// Resolved configuration, with file patterns expanded.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Label a line of `filename` would get.
    pub fn classify(&self, filename: &str, line: &str) -> Result<Label, ShipperError> {
        self.classifier.classify(filename, line)
    }

    /// Registers the configured files and drains both rings into `sink` until the
    /// scheduler is closed, the watcher stops, or `sink` fails.
    ///
    /// A scheduler runs once; it is closed when this returns.
    pub async fn run<S>(&self, sink: &mut S) -> Result<(), ShipperError>
    where
        S: Submit + ?Sized,
    {
        if self
            .shared
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ShipperError::InvalidState);
        }

        let result = self.run_inner(sink).await;
        if let Err(e) = &result {
            error!("Scheduler stopped on error: {}", e);
        }
        self.close();
        result
    }

    async fn run_inner<S>(&self, sink: &mut S) -> Result<(), ShipperError>
    where
        S: Submit + ?Sized,
    {
        let cold_timeout = self.config.cold_timeout();
        let (hot_tx, hot_rx) = mpsc::channel(self.shared.hot.capacity().max(1));
        let (cold_tx, cold_rx) = mpsc::channel(self.shared.cold.capacity().max(1));
        tokio::spawn(self.shared.clone().run_overflow(Label::Hot, hot_rx, cold_timeout));
        tokio::spawn(self.shared.clone().run_overflow(Label::Cold, cold_rx, cold_timeout));

        let handler = self.line_handler(hot_tx, cold_tx);
        for file in &self.config.files {
            self.shared
                .watcher
                .add_file(&file.filename, handler.clone())?;
        }
        drop(handler);
        info!(
            "Scheduler running with {} files, polling every {:?}",
            self.config.files.len(),
            self.config.polling_interval()
        );

        self.drain(sink).await
    }

    fn line_handler(
        &self,
        hot: mpsc::Sender<LogLine>,
        cold: mpsc::Sender<LogLine>,
    ) -> LineHandler {
        let classifier = self.classifier.clone();
        let shared = self.shared.clone();
        Arc::new(move |path: &Path, data: &[u8]| {
            let filename = path.to_string_lossy();
            let label = classifier.classify(&filename, &String::from_utf8_lossy(data))?;
            let line = LogLine::new(filename.into_owned(), data.to_vec());
            let overflow = match label {
                Label::Hot => &hot,
                Label::Cold => &cold,
            };
            shared.insert(label, line, overflow);
            Ok(())
        })
    }

    async fn drain<S>(&self, sink: &mut S) -> Result<(), ShipperError>
    where
        S: Submit + ?Sized,
    {
        let shared = &self.shared;
        let watcher_done = shared.watcher.done_token();
        let hot_threshold = self.config.hot_ring_threshold;
        let cold_threshold = self.config.cold_ring_threshold;

        // Ticks on a fixed schedule no matter how often the rings signal, so
        // the cold side is drained at least once per polling interval.
        let mut polling = tokio::time::interval(self.config.polling_interval());
        polling.set_missed_tick_behavior(MissedTickBehavior::Delay);
        polling.tick().await;

        while shared.is_running() {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => break,
                () = watcher_done.cancelled() => {
                    return match shared.watcher.take_error() {
                        Some(e) => Err(e.into()),
                        None => Ok(()),
                    };
                }
                _ = polling.tick() => {
                    sink.submit_hot(shared.hot.pop(hot_threshold).await).await?;
                    sink.submit_cold(shared.cold.pop(cold_threshold).await).await?;
                }
                () = shared.hot.ready() => {
                    sink.submit_hot(shared.hot.pop(hot_threshold).await).await?;
                }
                () = shared.cold.ready() => {
                    sink.submit_cold(shared.cold.pop(cold_threshold).await).await?;
                }
            }
        }
        Ok(())
    }
}
