use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::engine::queue::WorkQueue;
use crate::engine::report::{Report, Reporter, WorkEvent};
use crate::error::{Error, Result};
use crate::process::ChildRegistry;

/// A unit of work travelling through the queue.
pub trait Task: Send + 'static {
    fn label(&self) -> String;

    /// Spend one attempt after a retryable failure. Returns the attempts left
    /// when the task should be queued again, `None` when it is finished.
    fn spend_retry(&mut self) -> Option<u32> {
        None
    }
}

type Handler<T> = dyn Fn(&T) -> Result<()> + Send + Sync;

struct Shared<T> {
    queue: WorkQueue<T>,
    handler: Arc<Handler<T>>,
    registry: ChildRegistry,
    reporter: Arc<Reporter>,
    inflight: Arc<Mutex<BTreeMap<usize, (String, Instant)>>>,
    fatal: Arc<Mutex<Option<Error>>>,
    exited: mpsc::Sender<usize>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            registry: self.registry.clone(),
            reporter: Arc::clone(&self.reporter),
            inflight: Arc::clone(&self.inflight),
            fatal: Arc::clone(&self.fatal),
            exited: self.exited.clone(),
        }
    }
}

/// Bounded set of worker threads draining a `WorkQueue`, supervised by a
/// polling loop that replaces dead workers while work remains.
pub struct Pool {
    workers: usize,
    poll_interval: Duration,
    registry: ChildRegistry,
}

impl Pool {
    pub fn new(workers: usize, poll_interval: Duration, registry: ChildRegistry) -> Self {
        Self {
            workers: workers.max(1),
            poll_interval,
            registry,
        }
    }

    /// Run `handler` over every queued task until the queue is drained and no
    /// worker is alive. A fatal error from any task cancels the run and is
    /// returned once the remaining workers have stopped.
    pub fn run<T, F>(&self, what: &str, queue: WorkQueue<T>, handler: F) -> Result<Report>
    where
        T: Task,
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        if queue.is_empty() {
            info!("{what}: nothing to do");
            return Ok(Report::default());
        }

        let (tx, rx) = mpsc::channel();
        let shared = Shared {
            queue: queue.clone(),
            handler: Arc::new(handler),
            registry: self.registry.clone(),
            reporter: Arc::new(Reporter::new()),
            inflight: Arc::new(Mutex::new(BTreeMap::new())),
            fatal: Arc::new(Mutex::new(None)),
            exited: tx,
        };

        let mut handles: BTreeMap<usize, JoinHandle<()>> = BTreeMap::new();
        let mut next_worker = 0usize;
        let initial = self.workers.min(queue.len());
        for _ in 0..initial {
            spawn_worker(&shared, &mut handles, &mut next_worker);
        }
        info!("{what}: {} queued, {initial} workers", queue.len());

        loop {
            // Wake early when a worker exits; otherwise poll for dead ones.
            let _ = rx.recv_timeout(self.poll_interval);
            self.reap(&shared, &mut handles);

            if self.registry.cancelled() {
                break;
            }
            let pending = queue.len();
            let mut live = handles.len();
            if pending == 0 && live == 0 {
                break;
            }
            while live < self.workers && pending > live {
                if !spawn_worker(&shared, &mut handles, &mut next_worker) {
                    break;
                }
                live += 1;
            }
            if pending > 0 && live == 0 {
                spawn_worker(&shared, &mut handles, &mut next_worker);
            }
        }

        for (_, h) in std::mem::take(&mut handles) {
            let _ = h.join();
        }

        let report = shared.reporter.finish(what);
        let fatal = shared
            .fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(e) = fatal {
            return Err(e);
        }
        if self.registry.cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(report)
    }

    fn reap<T: Task>(&self, shared: &Shared<T>, handles: &mut BTreeMap<usize, JoinHandle<()>>) {
        let finished: Vec<usize> = handles
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for worker in finished {
            let Some(h) = handles.remove(&worker) else {
                continue;
            };
            let panicked = h.join().is_err();
            if panicked {
                let lost = shared
                    .inflight
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&worker);
                if let Some((id, started)) = lost {
                    shared.reporter.emit(WorkEvent::Failed {
                        id,
                        error: "worker panicked".into(),
                        elapsed_ms: started.elapsed().as_millis(),
                    });
                }
            }
            shared
                .reporter
                .emit(WorkEvent::WorkerDied { worker, panicked });
        }
    }
}

fn spawn_worker<T: Task>(
    shared: &Shared<T>,
    handles: &mut BTreeMap<usize, JoinHandle<()>>,
    next_worker: &mut usize,
) -> bool {
    let worker = *next_worker;
    *next_worker += 1;
    let sh = shared.clone();
    match thread::Builder::new()
        .name(format!("worker-{worker}"))
        .spawn(move || work(worker, sh))
    {
        Ok(h) => {
            shared.reporter.emit(WorkEvent::WorkerSpawned { worker });
            handles.insert(worker, h);
            true
        }
        Err(e) => {
            warn!(worker, "failed to spawn worker: {e}");
            false
        }
    }
}

fn work<T: Task>(worker: usize, sh: Shared<T>) {
    while !sh.registry.cancelled() {
        let Some(mut item) = sh.queue.try_dequeue() else {
            break;
        };
        let id = item.label();
        let start = Instant::now();
        set_inflight(&sh, worker, Some((id.clone(), start)));
        sh.reporter.emit(WorkEvent::Started { id: id.clone() });

        let res = (sh.handler)(&item);
        let elapsed_ms = start.elapsed().as_millis();
        set_inflight(&sh, worker, None);

        match res {
            Ok(()) => sh.reporter.emit(WorkEvent::Done { id, elapsed_ms }),
            Err(Error::Cancelled) => {
                debug!(item = %id, "abandoned after cancellation");
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(item = %id, "{e}; stopping the run");
                sh.registry.request_cancel();
                let mut slot = sh.fatal.lock().unwrap_or_else(|p| p.into_inner());
                slot.get_or_insert(e);
                break;
            }
            Err(e) => {
                let remaining = if e.is_retryable() {
                    item.spend_retry()
                } else {
                    None
                };
                match remaining {
                    Some(remaining) => {
                        sh.reporter.emit(WorkEvent::Retrying {
                            id,
                            remaining,
                            error: e.to_string(),
                        });
                        sh.queue.enqueue(item);
                    }
                    None => sh.reporter.emit(WorkEvent::Failed {
                        id,
                        error: e.to_string(),
                        elapsed_ms,
                    }),
                }
            }
        }
    }
    let _ = sh.exited.send(worker);
}

fn set_inflight<T>(sh: &Shared<T>, worker: usize, value: Option<(String, Instant)>) {
    let mut g = sh.inflight.lock().unwrap_or_else(|p| p.into_inner());
    match value {
        Some(v) => g.insert(worker, v),
        None => g.remove(&worker),
    };
}
