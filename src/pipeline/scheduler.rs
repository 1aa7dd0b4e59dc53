//! Fixed-interval driver for [`Processor`] with a cooperative stop.

use super::processor::{CycleReport, Processor};
use crate::error::CycleError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Instrument};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Totals over the life of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub written: u64,
    pub skipped: u64,
    pub high_risk: u64,
}

impl LoopStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.written += report.written as u64;
        self.skipped += report.skipped.len() as u64;
        self.high_risk += report.high_risk as u64;
    }
}

pub struct ProcessingLoop {
    processor: Arc<Processor>,
}

impl ProcessingLoop {
    pub fn new(processor: Arc<Processor>) -> Self {
        Self { processor }
    }

    /// Spawn the loop. The first cycle runs immediately; later ticks that
    /// fall due while a cycle is still running are skipped, so at most one
    /// cycle is ever in flight. Intervals under 1 ms are raised to 1 ms.
    pub fn start(self, interval: Duration) -> LoopHandle {
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(self.processor, interval, stop_rx));
        info!(interval_ms = interval.as_millis() as u64, "processing loop started");
        LoopHandle { stop_tx, task }
    }
}

pub struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<LoopStats>,
}

impl LoopHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop and wait for it to exit. An in-flight cycle stops at
    /// the next event boundary; the current write/mark pair always finishes.
    pub async fn stop(self) -> LoopStats {
        let _ = self.stop_tx.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "processing loop task ended abnormally");
                LoopStats::default()
            }
        }
    }
}

async fn run(processor: Arc<Processor>, interval: Duration, mut stop_rx: watch::Receiver<bool>) -> LoopStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = LoopStats::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        stats.cycles += 1;
        let span = tracing::info_span!("cycle", n = stats.cycles, cycle_id = %uuid::Uuid::new_v4());
        match processor.run_cycle_until(&stop_rx).instrument(span).await {
            Ok(report) => stats.absorb(&report),
            Err(CycleError::Cancelled { report, .. }) => {
                stats.absorb(&report);
                break;
            }
            Err(e) => {
                stats.failed_cycles += 1;
                warn!(cycle = stats.cycles, error = %e, "cycle failed; retrying next tick");
            }
        }
    }

    info!(
        cycles = stats.cycles,
        failed = stats.failed_cycles,
        written = stats.written,
        "processing loop stopped"
    );
    stats
}
