//! Roster polling and the bounded pool of recording workers.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::RecorderConfig;
use crate::db::{RecordStore, Streamer, StreamerRoster};
use crate::ipfs::{ContentStore, GatewayTemplate};
use crate::record::{RecorderContext, Worker, WorkerControl};
use crate::signal::CloseSignal;
use crate::streaming::StreamResolver;

/// Active sessions by streamer id. `None` marks a job that was submitted
/// but has not started yet.
type ActiveMap = HashMap<i64, Option<Arc<WorkerControl>>>;

/// State shared between the scheduler and its pool threads
struct PoolState {
    context: Arc<RecorderContext>,
    active: Mutex<ActiveMap>,
    idle: Condvar,
    closed: AtomicBool,
    aborted: AtomicBool,
}

impl PoolState {
    fn lock_active(&self) -> MutexGuard<'_, ActiveMap> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, streamer_id: i64) {
        let mut active = self.lock_active();
        active.remove(&streamer_id);
        if active.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Turn a reservation into a running session, unless shutdown began
    fn begin(&self, streamer_id: i64, control: &Arc<WorkerControl>) -> bool {
        let mut active = self.lock_active();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        active.insert(streamer_id, Some(Arc::clone(control)));
        true
    }
}

/// Watches the roster and records every streamer that goes live, with at
/// most `max_concurrent_recorders` sessions at a time
pub struct Scheduler {
    roster: Arc<dyn StreamerRoster>,
    check_interval: Duration,
    max_workers: usize,
    state: Arc<PoolState>,
    jobs: Mutex<Option<Sender<Streamer>>>,
    pool: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    // Ends the sleep between passes
    wakeup: CloseSignal,
    // Fired once every pool thread has exited
    done: CloseSignal,
}

impl Scheduler {
    pub fn new(
        config: &RecorderConfig,
        roster: Arc<dyn StreamerRoster>,
        resolver: Arc<dyn StreamResolver>,
        store: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
    ) -> io::Result<Self> {
        let context = RecorderContext {
            resolver,
            store,
            content,
            gateway: GatewayTemplate::new(config.gateway_url_template.clone()),
            flush_threshold: config.flush_threshold(),
            playlist_type: config
                .playlist_type()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            temp_dir: config.temp_dir.clone(),
        };
        let max_workers = config.max_concurrent_recorders.max(1);
        let state = Arc::new(PoolState {
            context: Arc::new(context),
            active: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        });

        let (sender, receiver) = bounded::<Streamer>(max_workers);
        let mut pool = Vec::with_capacity(max_workers);
        for n in 0..max_workers {
            let state = Arc::clone(&state);
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("recorder-{}", n))
                .spawn(move || run_pool_thread(state, receiver))?;
            pool.push(handle);
        }

        Ok(Self {
            roster,
            check_interval: config.check_interval(),
            max_workers,
            state,
            jobs: Mutex::new(Some(sender)),
            pool: Mutex::new(pool),
            shutting_down: AtomicBool::new(false),
            wakeup: CloseSignal::new(),
            done: CloseSignal::new(),
        })
    }

    /// Poll the roster every check interval until closed
    pub fn start(&self) {
        if self.is_closed() {
            return;
        }
        info!(
            "Watching streamers every {}s with up to {} recorders",
            self.check_interval.as_secs(),
            self.max_workers
        );
        while !self.is_closed() {
            self.run_once();
            if self.wakeup.wait_timeout(self.check_interval) {
                break;
            }
        }
        debug!("Scheduler loop stopped");
    }

    /// One pass over the roster: start a session for every streamer not
    /// already recording while the pool has room
    pub fn run_once(&self) {
        if self.is_closed() {
            return;
        }
        let streamers = match self.roster.streamers() {
            Ok(streamers) => streamers,
            Err(e) => {
                warn!("Failed to read streamers: {}", e);
                return;
            }
        };

        for streamer in streamers {
            if self.is_closed() {
                break;
            }
            {
                let mut active = self.state.lock_active();
                if active.contains_key(&streamer.id) {
                    continue;
                }
                if active.len() >= self.max_workers {
                    debug!("All {} recorders busy, waiting for next pass", self.max_workers);
                    break;
                }
                active.insert(streamer.id, None);
            }

            let id = streamer.id;
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let submitted = match jobs.as_ref() {
                Some(sender) => sender.send(streamer).is_ok(),
                None => false,
            };
            drop(jobs);
            if !submitted {
                self.state.release(id);
                break;
            }
        }
    }

    /// Stop recording and wait for every session to flush what it captured.
    ///
    /// Idempotent; concurrent callers all return once shutdown is complete.
    pub fn close(&self) {
        self.shutdown(false);
    }

    /// Like [`close`](Self::close), but sessions drop their buffered
    /// segments and cancel uploads that have not started
    pub fn abort(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, abort: bool) {
        if abort {
            self.state.aborted.store(true, Ordering::SeqCst);
        }
        self.state.closed.store(true, Ordering::SeqCst);
        self.wakeup.fire();

        {
            let active = self.state.lock_active();
            for control in active.values().flatten() {
                if abort {
                    control.abort();
                } else {
                    control.close();
                }
            }
        }

        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.done.wait();
            return;
        }

        info!(
            "{} recorders, waiting for {} sessions",
            if abort { "Aborting" } else { "Closing" },
            self.active_count()
        );
        // Queued jobs see the closed flag and are dropped
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        let pool = std::mem::take(&mut *self.pool.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in pool {
            if handle.join().is_err() {
                error!("Recorder thread panicked");
            }
        }
        self.done.fire();
        info!("All recorders stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Sessions running or waiting for a pool thread
    pub fn active_count(&self) -> usize {
        self.state.lock_active().len()
    }

    /// Block until no session is active; returns false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let active = self.state.lock_active();
        let (active, _) = self
            .state
            .idle
            .wait_timeout_while(active, timeout, |active| !active.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        active.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_pool_thread(state: Arc<PoolState>, receiver: Receiver<Streamer>) {
    for streamer in receiver.iter() {
        let id = streamer.id;
        let name = streamer.name.clone();
        let control = Arc::new(WorkerControl::new());
        if !state.begin(id, &control) {
            debug!("[{}] Shutting down, recording not started", name);
            state.release(id);
            continue;
        }

        let worker = Worker::new(streamer, Arc::clone(&state.context), control);
        match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
            Ok(Ok(summary)) => {
                if summary.stream_id.is_some() {
                    debug!("[{}] Session ended after {} segments", name, summary.segments);
                }
            }
            Ok(Err(e)) => error!("[{}] Recording failed: {}", name, e),
            Err(_) => error!("[{}] Recorder panicked", name),
        }
        state.release(id);
    }
}
