use crate::cancel::{StaleGuard, TaskToken};
use log::debug;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct PollSchedule {
    pub every: Duration,
}

impl PollSchedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.every.is_zero() {
            return Err("poll interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            every: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Runs one repeating check at a time: an immediate first tick, then one per interval.
///
/// `start` replaces any run in progress and `stop` is safe to call at any time.
#[derive(Debug)]
pub struct PollingScheduler {
    every: Duration,
    guard: StaleGuard,
    active: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(schedule: PollSchedule) -> Result<Self, String> {
        schedule.validate()?;
        Ok(Self {
            every: schedule.every,
            guard: StaleGuard::new(),
            active: Mutex::new(None),
        })
    }

    /// Starts polling with `tick`. The ticket passed to each tick goes stale
    /// as soon as this run is stopped or replaced.
    pub fn start<F, Fut>(&self, mut tick: F) -> TaskToken
    where
        F: FnMut(TaskToken) -> Fut + Send + 'static,
        Fut: Future<Output = PollOutcome> + Send + 'static,
    {
        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            debug!("scheduler: replacing active poll");
            previous.abort();
        }

        let ticket = self.guard.advance();
        let every = self.every;
        let run_ticket = ticket.clone();
        *active = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if run_ticket.is_stale() {
                    break;
                }
                if tick(run_ticket.clone()).await == PollOutcome::Stop {
                    break;
                }
            }
        }));
        ticket
    }

    pub fn stop(&self) {
        let mut active = self.lock_active();
        self.guard.advance();
        if let Some(handle) = active.take() {
            debug!("scheduler: stopping poll");
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
