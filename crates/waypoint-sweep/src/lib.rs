//! Fixed-interval maintenance sweeps for Waypoint.
//!
//! Ticket expiry, character-cache eviction and game-directory purges all
//! share one shape: "every N seconds, walk a map and drop what has gone
//! stale". [`Sweeper`] owns the timer for one such pass, runs it on its own
//! task (never on a connection worker) and keeps failures contained: a pass
//! that errors or panics is logged and the next tick runs as usual.
//!
//! A pass can also be forced synchronously with [`SweepHandle::run_now`],
//! which resolves once that pass has finished. The session registry's
//! "nuke all" uses this.
//!
//! ```ignore
//! let handle = Sweeper::new(SweepConfig::every("ticket-expiry", Duration::from_secs(15)))
//!     .spawn(move || {
//!         let registry = registry.clone();
//!         async move { Ok(registry.sweep().await) }
//!     });
//! ```

use std::error::Error;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Error type a pass may return. Anything implementing `std::error::Error`
/// converts into it with `?`.
pub type PassError = Box<dyn Error + Send + Sync>;

/// Outcome of one pass: the number of entries it evicted.
pub type PassResult = Result<usize, PassError>;

/// Errors surfaced through a [`SweepHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    /// The pass returned an error.
    #[error("sweep pass '{name}' failed: {message}")]
    Failed { name: String, message: String },

    /// The pass panicked.
    #[error("sweep pass '{name}' panicked")]
    Panicked { name: String },

    /// The sweeper task is gone.
    #[error("sweeper '{0}' is not running")]
    Stopped(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Name used in logs.
    pub name: String,
    /// Time between passes.
    pub interval: Duration,
    /// Random delay (0..max) added before the first pass so sweepers
    /// created together do not fire together.
    pub initial_jitter: Duration,
}

impl SweepConfig {
    /// Shortest interval a sweeper accepts.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

    pub fn every(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            initial_jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.initial_jitter = jitter;
        self
    }

    /// Clamps out-of-range values. Called by [`Sweeper::new`].
    pub fn validated(mut self) -> Self {
        if self.interval < Self::MIN_INTERVAL {
            warn!(
                sweeper = %self.name,
                interval_ms = self.interval.as_millis() as u64,
                min_ms = Self::MIN_INTERVAL.as_millis() as u64,
                "sweep interval below minimum, clamping"
            );
            self.interval = Self::MIN_INTERVAL;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Snapshot of a sweeper's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepMetrics {
    /// Passes that completed successfully.
    pub passes: u64,
    /// Passes that returned an error or panicked.
    pub failures: u64,
    /// Total entries evicted across successful passes.
    pub evicted: u64,
    /// Wall-clock duration of the most recent pass.
    pub last_duration: Duration,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    failures: AtomicU64,
    evicted: AtomicU64,
    last_duration_us: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SweepMetrics {
        SweepMetrics {
            passes: self.passes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            last_duration: Duration::from_micros(self.last_duration_us.load(Ordering::Relaxed)),
        }
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

enum Command {
    RunNow(oneshot::Sender<Result<usize, SweepError>>),
    Stop,
}

/// Builder for a sweep task.
pub struct Sweeper {
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config: config.validated(),
        }
    }

    /// Spawns the timer task. `pass` is called once per tick and once per
    /// [`SweepHandle::run_now`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(self, pass: F) -> SweepHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PassResult> + Send + 'static,
    {
        let config = self.config;
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(8);

        let jitter = if config.initial_jitter > Duration::ZERO {
            let us = rand::rng().random_range(0..config.initial_jitter.as_micros() as u64);
            Duration::from_micros(us)
        } else {
            Duration::ZERO
        };

        debug!(
            sweeper = %config.name,
            interval_ms = config.interval.as_millis() as u64,
            jitter_us = jitter.as_micros() as u64,
            "sweeper started"
        );

        let name = config.name.clone();
        let task = tokio::spawn(run_loop(config, jitter, pass, rx, Arc::clone(&counters)));

        SweepHandle {
            name,
            commands: tx,
            counters,
            task,
        }
    }
}

async fn run_loop<F, Fut>(
    config: SweepConfig,
    jitter: Duration,
    pass: F,
    mut commands: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PassResult> + Send + 'static,
{
    let start = TokioInstant::now() + config.interval + jitter;
    let mut ticker = time::interval_at(start, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = run_pass(&config.name, &pass, &counters).await;
            }
            cmd = commands.recv() => match cmd {
                Some(Command::RunNow(ack)) => {
                    let result = run_pass(&config.name, &pass, &counters).await;
                    let _ = ack.send(result);
                }
                Some(Command::Stop) | None => break,
            },
        }
    }

    debug!(sweeper = %config.name, "sweeper stopped");
}

async fn run_pass<F, Fut>(name: &str, pass: &F, counters: &Counters) -> Result<usize, SweepError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = PassResult>,
{
    let started = Instant::now();
    let outcome = AssertUnwindSafe(async { pass().await }).catch_unwind().await;
    let elapsed = started.elapsed();
    counters
        .last_duration_us
        .store(elapsed.as_micros() as u64, Ordering::Relaxed);

    match outcome {
        Ok(Ok(evicted)) => {
            counters.passes.fetch_add(1, Ordering::Relaxed);
            counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            if evicted > 0 {
                debug!(sweeper = name, evicted, "sweep pass evicted entries");
            } else {
                trace!(sweeper = name, "sweep pass clean");
            }
            Ok(evicted)
        }
        Ok(Err(e)) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(sweeper = name, error = %e, "sweep pass failed");
            Err(SweepError::Failed {
                name: name.to_string(),
                message: e.to_string(),
            })
        }
        Err(_) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(sweeper = name, "sweep pass panicked");
            Err(SweepError::Panicked {
                name: name.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control handle for a running sweeper. Dropping it stops the sweeper.
pub struct SweepHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a pass immediately and waits for it to finish.
    pub async fn run_now(&self) -> Result<usize, SweepError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::RunNow(ack_tx))
            .await
            .map_err(|_| SweepError::Stopped(self.name.clone()))?;
        ack_rx
            .await
            .map_err(|_| SweepError::Stopped(self.name.clone()))?
    }

    pub fn metrics(&self) -> SweepMetrics {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the timer and waits for the task to exit. A pass already in
    /// progress is allowed to finish.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop).await;
        let _ = self.task.await;
    }
}
