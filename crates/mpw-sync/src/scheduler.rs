//! Fixed-interval task runner.
//!
//! Tasks run one at a time. Every task is due when the scheduler starts and
//! fires in registration order; afterwards each one is due `period` after its
//! previous due time. A task that overruns is delayed, never skipped, and
//! missed periods are not replayed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Logical clock: sleeping advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Moves logical time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap_or_else(|p| p.into_inner()) += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// A unit of recurring work. Implementations report their own failures.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextDue {
    /// Not run yet.
    Now,
    At(Instant),
    /// The next due time is past what `Instant` can represent.
    Never,
}

struct Entry {
    period: Duration,
    task: Arc<dyn ScheduledTask>,
    next_due: NextDue,
}

pub struct Scheduler<C: Clock> {
    clock: Arc<C>,
    entries: Vec<Entry>,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    pub fn every(mut self, period: Duration, task: Arc<dyn ScheduledTask>) -> Self {
        self.entries.push(Entry {
            period,
            task,
            next_due: NextDue::Now,
        });
        self
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.task.name()).collect()
    }

    /// Waits for the earliest due task, runs it, and returns its name.
    /// Ties go to the task registered first. `None` when no task is left to run.
    pub async fn step(&mut self) -> Option<String> {
        let now = self.clock.now();
        let (index, due) = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry.next_due {
                NextDue::Now => Some((index, now)),
                NextDue::At(due) => Some((index, due)),
                NextDue::Never => None,
            })
            .min_by_key(|(_, due)| *due)?;

        let now = self.clock.now();
        if due > now {
            let wait = due - now;
            debug!(wait_secs = wait.as_secs(), "sleeping until next task");
            self.clock.sleep(wait).await;
        }

        let task = Arc::clone(&self.entries[index].task);
        let name = task.name().to_string();
        info!(task = %name, "running scheduled task");
        task.run().await;

        let finished = self.clock.now();
        let entry = &mut self.entries[index];
        entry.next_due = match due.checked_add(entry.period) {
            Some(next) => NextDue::At(next.max(finished)),
            None => {
                warn!(task = %name, "next run is out of range; task retired");
                NextDue::Never
            }
        };
        Some(name)
    }

    pub async fn run_forever(mut self) {
        loop {
            if self.step().await.is_none() {
                info!("no scheduled tasks left to run");
                std::future::pending::<()>().await;
            }
        }
    }
}
