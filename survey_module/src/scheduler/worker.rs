use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{error, info};
use uuid::Uuid;

use super::core::DeferredScheduler;
use super::handler::TaskHandler;

pub struct SchedulerControl {
    stop: Arc<AtomicBool>,
    wake: Box<dyn Fn() + Send + Sync>,
    periodic_stops: Vec<Sender<()>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl SchedulerControl {
    /// Runs `job` every `interval` on its own thread until the control stops.
    pub fn spawn_periodic<F>(&mut self, interval: Duration, job: F)
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stop = self.stop.clone();
        self.periodic_stops.push(stop_tx);
        self.handles.push(thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) if !stop.load(Ordering::Relaxed) => job(),
                _ => break,
            }
        }));
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        (self.wake)();
        for stop_tx in &self.periodic_stops {
            let _ = stop_tx.try_send(());
        }
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub(crate) struct ConcurrencyLimiter {
    max: usize,
    in_flight: Mutex<usize>,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_flight: Mutex::new(0),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if *in_flight >= self.max {
            return false;
        }
        *in_flight += 1;
        true
    }

    pub(crate) fn release(&self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if *in_flight > 0 {
            *in_flight -= 1;
        }
    }
}

/// Starts the timer thread. Each claimed due task runs on its own worker
/// thread, at most `max_concurrency` at a time.
pub fn start_scheduler_threads<H>(
    scheduler: Arc<DeferredScheduler<H>>,
    poll_interval: Duration,
    max_concurrency: usize,
) -> SchedulerControl
where
    H: TaskHandler + Send + Sync + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let limiter = Arc::new(ConcurrencyLimiter::new(max_concurrency));
    let query_limit = max_concurrency.saturating_mul(4).max(1);

    let handle = {
        let scheduler = scheduler.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut last_due: HashSet<Uuid> = HashSet::new();
            let mut last_capacity_deferral: Option<usize> = None;
            while !stop.load(Ordering::Relaxed) {
                match scheduler.due_tasks(Utc::now(), query_limit) {
                    Ok(due) => {
                        let current_due = due.iter().map(|task| task.id).collect::<HashSet<_>>();
                        if current_due != last_due && !current_due.is_empty() {
                            info!("scheduler found {} due task(s)", due.len());
                        }
                        last_due = current_due;
                        if due.is_empty() {
                            last_capacity_deferral = None;
                        }
                        let total = due.len();
                        for (idx, task) in due.into_iter().enumerate() {
                            if !limiter.try_acquire() {
                                let remaining = total.saturating_sub(idx);
                                if last_capacity_deferral != Some(remaining) {
                                    info!(
                                        "scheduler at capacity; deferring {} due task(s)",
                                        remaining
                                    );
                                    last_capacity_deferral = Some(remaining);
                                }
                                break;
                            }
                            last_capacity_deferral = None;
                            if !scheduler.try_claim(task.id) {
                                limiter.release();
                                continue;
                            }

                            let scheduler = scheduler.clone();
                            let limiter = limiter.clone();
                            thread::spawn(move || {
                                if let Err(err) = scheduler.execute_task(&task) {
                                    error!(
                                        "{} task {} could not be recorded: {}",
                                        task.kind.label(),
                                        task.id,
                                        err
                                    );
                                }
                                scheduler.release_claim(task.id);
                                limiter.release();
                            });
                        }
                    }
                    Err(err) => {
                        error!("deferred task query failed: {}", err);
                    }
                }
                scheduler.wait_for_wakeup(scheduler.next_wakeup(Utc::now(), poll_interval));
            }
        })
    };

    let wake_target = scheduler.clone();
    SchedulerControl {
        stop,
        wake: Box::new(move || wake_target.wake()),
        periodic_stops: Vec::new(),
        handles: vec![handle],
    }
}
