use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unit-of-work handler run on a pool thread
pub trait TaskProcessor<T>: Send + Sync {
    fn process_task(&self, worker_id: usize, task: T) -> Result<()>;
}

#[derive(Debug)]
pub enum WorkItem<T> {
    Task(T),
    Shutdown,
}

#[derive(Debug)]
enum WorkerEvent {
    Finished,
    Exited(usize),
}

#[derive(Debug, Default)]
struct Metrics {
    submitted: u64,
    running: u64,
    completed: u64,
    failed: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskManagerStatus {
    pub queued_tasks: u64,
    pub running_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_error: Option<String>,
    /// Set when shutdown gave up waiting on stalled workers
    pub timed_out: bool,
}

/// Fixed-size pool of named OS threads fed through a bounded channel.
/// `submit` blocks once `workers * 2` tasks are waiting.
pub struct TaskManager<T> {
    name: String,
    workers: usize,
    work_sender: Sender<WorkItem<T>>,
    event_receiver: Receiver<WorkerEvent>,
    handles: Vec<thread::JoinHandle<()>>,
    metrics: Arc<Mutex<Metrics>>,
}

/// Reports the worker gone even if the processor panicked
struct ExitGuard {
    worker_id: usize,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited(self.worker_id));
    }
}

impl<T: Send + 'static> TaskManager<T> {
    pub fn start(
        name: &str,
        num_workers: usize,
        processor: Arc<dyn TaskProcessor<T>>,
    ) -> Result<Self> {
        let num_workers = num_workers.max(1);
        info!("Starting {} pool with {} workers", name, num_workers);

        let (work_sender, work_receiver) = bounded(num_workers * 2);
        let (event_sender, event_receiver) = unbounded();
        let metrics = Arc::new(Mutex::new(Metrics::default()));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let work_receiver = work_receiver.clone();
            let event_sender = event_sender.clone();
            let metrics = metrics.clone();
            let processor = processor.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || {
                    worker_loop(worker_id, work_receiver, event_sender, metrics, processor)
                })
                .with_context(|| format!("Failed to spawn {} worker {}", name, worker_id))?;
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            workers: num_workers,
            work_sender,
            event_receiver,
            handles,
            metrics,
        })
    }

    /// Queue one task, waiting for space when the pool is saturated
    pub fn submit(&self, task: T) -> Result<()> {
        self.metrics.lock().submitted += 1;
        self.work_sender
            .send(WorkItem::Task(task))
            .map_err(|_| anyhow::anyhow!("{} pool is not accepting work", self.name))
    }

    pub fn get_status(&self) -> TaskManagerStatus {
        let m = self.metrics.lock();
        TaskManagerStatus {
            queued_tasks: m.submitted.saturating_sub(m.running + m.completed + m.failed),
            running_tasks: m.running,
            completed_tasks: m.completed,
            failed_tasks: m.failed,
            last_error: m.last_error.clone(),
            timed_out: false,
        }
    }

    /// Let queued work drain, then stop the workers.
    ///
    /// `grace` bounds how long the pool may go without finishing a task. When it
    /// elapses the remaining threads are detached and the status is `timed_out`.
    pub fn shutdown(mut self, grace: Duration) -> TaskManagerStatus {
        info!("Shutting down {} pool", self.name);

        let mut deadline = Instant::now() + grace;
        let mut exited = 0;
        let mut timed_out = false;

        for _ in 0..self.workers {
            let mut item = WorkItem::Shutdown;
            loop {
                match self.work_sender.send_timeout(item, Duration::from_millis(100)) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Disconnected(_)) => break,
                    Err(SendTimeoutError::Timeout(back)) => item = back,
                }
                // Count finished work while the queue is full so progress resets the deadline
                while let Ok(event) = self.event_receiver.try_recv() {
                    match event {
                        WorkerEvent::Finished => deadline = Instant::now() + grace,
                        WorkerEvent::Exited(_) => exited += 1,
                    }
                }
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
            }
            if timed_out {
                break;
            }
        }

        while !timed_out && exited < self.workers {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.event_receiver.recv_timeout(wait) {
                Ok(WorkerEvent::Finished) => deadline = Instant::now() + grace,
                Ok(WorkerEvent::Exited(worker_id)) => {
                    debug!("{}-{} exited", self.name, worker_id);
                    exited += 1;
                }
                Err(RecvTimeoutError::Timeout) => timed_out = true,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if timed_out {
            warn!(
                "{} pool: {} of {} workers still busy after {}, abandoning them",
                self.name,
                self.workers - exited,
                self.workers,
                humantime::format_duration(grace)
            );
        } else {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }

        let mut status = self.get_status();
        status.timed_out = timed_out;
        info!(
            "{} pool stopped: {} completed, {} failed",
            self.name, status.completed_tasks, status.failed_tasks
        );
        status
    }
}

fn worker_loop<T>(
    worker_id: usize,
    work_receiver: Receiver<WorkItem<T>>,
    event_sender: Sender<WorkerEvent>,
    metrics: Arc<Mutex<Metrics>>,
    processor: Arc<dyn TaskProcessor<T>>,
) {
    let _guard = ExitGuard {
        worker_id,
        events: event_sender.clone(),
    };
    debug!("Worker {} started", worker_id);

    loop {
        match work_receiver.recv() {
            Ok(WorkItem::Task(task)) => {
                metrics.lock().running += 1;
                let result = processor.process_task(worker_id, task);

                {
                    let mut m = metrics.lock();
                    m.running -= 1;
                    match result {
                        Ok(()) => m.completed += 1,
                        Err(e) => {
                            warn!("Worker {} task failed: {:#}", worker_id, e);
                            m.failed += 1;
                            m.last_error = Some(format!("{:#}", e));
                        }
                    }
                }
                let _ = event_sender.send(WorkerEvent::Finished);
            }
            Ok(WorkItem::Shutdown) => {
                debug!("Worker {} shutting down", worker_id);
                break;
            }
            Err(_) => {
                warn!("Worker {} channel closed", worker_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl TaskProcessor<usize> for Counter {
        fn process_task(&self, _worker_id: usize, task: usize) -> Result<()> {
            if task % 10 == 9 {
                anyhow::bail!("task {} failed", task);
            }
            self.0.fetch_add(task, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_runs_every_task_and_counts_failures() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let pool = TaskManager::<usize>::start("test", 4, counter.clone()).unwrap();
        for i in 0..100 {
            pool.submit(i).unwrap();
        }
        let status = pool.shutdown(Duration::from_secs(10));

        let expected: usize = (0..100).filter(|i| i % 10 != 9).sum();
        assert_eq!(counter.0.load(Ordering::SeqCst), expected);
        assert_eq!(status.completed_tasks, 90);
        assert_eq!(status.failed_tasks, 10);
        assert_eq!(status.queued_tasks, 0);
        assert!(status.last_error.is_some());
        assert!(!status.timed_out);
    }

    struct Sleeper;

    impl TaskProcessor<u64> for Sleeper {
        fn process_task(&self, _worker_id: usize, millis: u64) -> Result<()> {
            thread::sleep(Duration::from_millis(millis));
            Ok(())
        }
    }

    #[test]
    fn test_stalled_worker_times_out() {
        let pool = TaskManager::<u64>::start("stall", 1, Arc::new(Sleeper)).unwrap();
        pool.submit(2_000).unwrap();
        let status = pool.shutdown(Duration::from_millis(100));
        assert!(status.timed_out);
    }

    #[test]
    fn test_progress_extends_grace() {
        let pool = TaskManager::<u64>::start("steady", 1, Arc::new(Sleeper)).unwrap();
        for _ in 0..5 {
            pool.submit(40).unwrap();
        }
        // Total work exceeds the grace, but every task finishes inside it
        let status = pool.shutdown(Duration::from_millis(150));
        assert!(!status.timed_out);
        assert_eq!(status.completed_tasks, 5);
    }
}
