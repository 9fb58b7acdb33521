//! Auto-trading scheduler.
//!
//! Runs the pipeline on a fixed interval under a caller-selected strategy.
//! State machine:
//!
//! ```text
//! Stopped --start--> Running --stop--> Stopped
//! Running --emergency_stop--> EmergencyStopped --resume--> Running
//! Stopped --emergency_stop--> EmergencyStopped
//! ```
//!
//! Each run owns a `CancellationToken`. Stopping cancels it: no new tick
//! starts, and a tick already in flight finishes its confirmation wait but
//! skips submission if it has not submitted yet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::pipeline::{TickOutcome, TradingPipeline};
use crate::types::{Strategy, TradingError};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    EmergencyStopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Stopped => write!(f, "stopped"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::EmergencyStopped => write!(f, "emergency-stopped"),
        }
    }
}

struct Control {
    state: SchedulerState,
    strategy: Option<Strategy>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct AutoTradingScheduler {
    pipeline: Arc<TradingPipeline>,
    tick_interval: Duration,
    /// Parent of every run token; cancelled on shutdown.
    root: CancellationToken,
    control: Mutex<Control>,
}

impl AutoTradingScheduler {
    pub fn new(pipeline: Arc<TradingPipeline>, tick_interval: Duration) -> Self {
        Self {
            pipeline,
            tick_interval,
            root: CancellationToken::new(),
            control: Mutex::new(Control {
                state: SchedulerState::Stopped,
                strategy: None,
                cancel: None,
                task: None,
            }),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        self.control.lock().await.state
    }

    pub async fn active_strategy(&self) -> Option<Strategy> {
        let control = self.control.lock().await;
        match control.state {
            SchedulerState::Running => control.strategy.clone(),
            _ => None,
        }
    }

    /// Start ticking under `strategy`. A no-op when already running; refused
    /// after an emergency stop (use `resume`).
    pub async fn start(&self, strategy: Strategy) -> Result<SchedulerState, TradingError> {
        let mut control = self.control.lock().await;
        match control.state {
            SchedulerState::Running => {
                info!(strategy = %strategy.name, "Scheduler already running");
                Ok(SchedulerState::Running)
            }
            SchedulerState::EmergencyStopped => Err(TradingError::InvalidTransition {
                action: "start".to_string(),
                state: control.state.to_string(),
            }),
            SchedulerState::Stopped => {
                info!(
                    strategy = %strategy,
                    interval_secs = self.tick_interval.as_secs(),
                    "Starting auto-trading"
                );
                self.launch(&mut control, strategy);
                Ok(SchedulerState::Running)
            }
        }
    }

    /// Stop ticking. A no-op unless running.
    pub async fn stop(&self) -> SchedulerState {
        let mut control = self.control.lock().await;
        if control.state == SchedulerState::Running {
            if let Some(token) = control.cancel.take() {
                token.cancel();
            }
            control.state = SchedulerState::Stopped;
            info!("Auto-trading stopped");
        }
        control.state
    }

    /// Halt immediately from any state. The strategy is kept for `resume`.
    pub async fn emergency_stop(&self) -> SchedulerState {
        let mut control = self.control.lock().await;
        if let Some(token) = control.cancel.take() {
            token.cancel();
        }
        if control.state != SchedulerState::EmergencyStopped {
            warn!(previous = %control.state, "EMERGENCY STOP");
        }
        control.state = SchedulerState::EmergencyStopped;
        control.state
    }

    /// Leave an emergency stop. Resumes with the stored strategy, or returns
    /// to `Stopped` if none was ever started.
    pub async fn resume(&self) -> Result<SchedulerState, TradingError> {
        let mut control = self.control.lock().await;
        match control.state {
            SchedulerState::Running => Ok(SchedulerState::Running),
            SchedulerState::Stopped => Err(TradingError::InvalidTransition {
                action: "resume".to_string(),
                state: control.state.to_string(),
            }),
            SchedulerState::EmergencyStopped => match control.strategy.clone() {
                Some(strategy) => {
                    info!(strategy = %strategy.name, "Resuming auto-trading");
                    self.launch(&mut control, strategy);
                    Ok(SchedulerState::Running)
                }
                None => {
                    control.state = SchedulerState::Stopped;
                    Ok(SchedulerState::Stopped)
                }
            },
        }
    }

    /// Cancel everything and wait for the current run to finish its tick.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let task = {
            let mut control = self.control.lock().await;
            control.cancel = None;
            if control.state == SchedulerState::Running {
                control.state = SchedulerState::Stopped;
            }
            control.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }

    fn launch(&self, control: &mut Control, strategy: Strategy) {
        let token = self.root.child_token();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.pipeline),
            strategy.clone(),
            self.tick_interval,
            token.clone(),
        ));
        control.state = SchedulerState::Running;
        control.strategy = Some(strategy);
        control.cancel = Some(token);
        control.task = Some(task);
    }
}

async fn run_loop(
    pipeline: Arc<TradingPipeline>,
    strategy: Strategy,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(ticks = tick, "Scheduler loop exiting");
                break;
            }
            _ = ticker.tick() => {
                tick += 1;
                let outcome = pipeline.run_tick(&strategy, &cancel).await;
                log_tick(tick, &outcome);
            }
        }
    }
}

fn log_tick(tick: u64, outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Executed(entry) => info!(tick, id = %entry.id, "Tick executed trade"),
        TickOutcome::Failed(entry) => warn!(tick, id = %entry.id, "Tick trade failed"),
        TickOutcome::Skipped(reason) => warn!(tick, reason = %reason, "Tick skipped"),
        other => info!(tick, outcome = %other, "Tick complete"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
