//! Background work queues.
//!
//! Some operations the request thread must trigger are allowed to take
//! arbitrarily long: closing a file whose last reference unlinks it,
//! syncing an append log to disk, freeing an aggregate value with
//! millions of elements. Each such operation becomes a fire-and-forget
//! job handed to a dedicated worker.
//!
//! The design is deliberately small: one worker thread per job kind,
//! each kind owning a FIFO queue protected by a mutex and a pair of
//! condition variables (`new_job` wakes the worker, `step_done` wakes
//! anyone blocked in [`BackgroundWorkers::wait_one`]). Jobs of one
//! kind complete strictly in submission order; there is no ordering
//! across kinds, and no completion callback: completion is observable
//! only through [`BackgroundWorkers::pending`] and
//! [`BackgroundWorkers::wait_one`].

use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::SystemTime;

use tracing::{debug, warn};

/// The fixed set of job kinds. Each kind has its own queue and worker;
/// there is no dynamic registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// Close a file descriptor (dropping the handle) off-thread.
    CloseFile,
    /// Issue a blocking disk sync off-thread.
    FsyncFile,
    /// Run a large value's destructor off-thread.
    LazyFree,
}

const KIND_COUNT: usize = 3;

impl JobKind {
    const ALL: [Self; KIND_COUNT] = [Self::CloseFile, Self::FsyncFile, Self::LazyFree];

    const fn index(self) -> usize {
        match self {
            Self::CloseFile => 0,
            Self::FsyncFile => 1,
            Self::LazyFree => 2,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::CloseFile => "close-file",
            Self::FsyncFile => "fsync-file",
            Self::LazyFree => "lazy-free",
        }
    }
}

/// Payload of one background job.
pub enum Job {
    /// Take ownership of the file and close it on the worker.
    CloseFile(File),
    /// Sync the shared file handle on the worker.
    FsyncFile(Arc<File>),
    /// Drop the boxed structure on the worker. Any `Send` structure
    /// works: a detached value, a pair of retired dictionaries, an
    /// ordered index.
    LazyFree(Box<dyn Any + Send>),
}

impl Job {
    const fn kind(&self) -> JobKind {
        match self {
            Self::CloseFile(_) => JobKind::CloseFile,
            Self::FsyncFile(_) => JobKind::FsyncFile,
            Self::LazyFree(_) => JobKind::LazyFree,
        }
    }
}

struct QueuedJob {
    /// When the job was submitted. Useful in logs when a queue backs
    /// up.
    created: SystemTime,
    job: Job,
}

/// Queue contents plus the count of queued and in-flight jobs. The
/// count lags the queue by exactly the job the worker is currently
/// running, which is what makes `pending == 0` mean "all side effects
/// visible".
#[derive(Default)]
struct QueueInner {
    jobs: VecDeque<QueuedJob>,
    pending: u64,
}

#[derive(Default)]
struct QueueState {
    inner: Mutex<QueueInner>,
    new_job: Condvar,
    step_done: Condvar,
}

/// The worker pool. One instance per process; the request thread
/// submits, workers consume.
pub struct BackgroundWorkers {
    queues: Arc<[QueueState; KIND_COUNT]>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// A worker never panics, so a poisoned queue mutex can only come from
/// a panicking caller thread mid-submit; the queue data is still
/// structurally sound, so we keep going with it.
fn lock_queue(queue: &QueueState) -> MutexGuard<'_, QueueInner> {
    queue
        .inner
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl BackgroundWorkers {
    /// Spawn the three workers.
    #[must_use]
    pub fn start() -> Self {
        let queues: Arc<[QueueState; KIND_COUNT]> = Arc::new(Default::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(KIND_COUNT);

        for kind in JobKind::ALL {
            let queues = Arc::clone(&queues);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("fredis-bg-{}", kind.name()))
                .spawn(move || worker_loop(kind, &queues[kind.index()], &shutdown))
                .expect("spawning a background worker thread");
            handles.push(handle);
        }

        Self {
            queues,
            shutdown,
            handles,
        }
    }

    /// Append a job to its kind's queue and wake the worker. Returns
    /// immediately; the only blocking is the queue mutex, which the
    /// single consumer holds only briefly.
    pub fn submit(&self, job: Job) {
        let kind = job.kind();
        let queue = &self.queues[kind.index()];
        let mut inner = lock_queue(queue);
        inner.jobs.push_back(QueuedJob {
            created: SystemTime::now(),
            job,
        });
        inner.pending += 1;
        queue.new_job.notify_one();
    }

    /// Queued plus in-flight jobs of the given kind. When this reads
    /// zero, every side effect of previously submitted jobs of that
    /// kind is visible to the caller.
    #[must_use]
    pub fn pending(&self, kind: JobKind) -> u64 {
        lock_queue(&self.queues[kind.index()]).pending
    }

    /// If jobs of this kind are pending, block until the worker
    /// finishes at least one, and return the count still pending.
    /// Returns immediately with zero when the queue is idle.
    pub fn wait_one(&self, kind: JobKind) -> u64 {
        let queue = &self.queues[kind.index()];
        let mut inner = lock_queue(queue);
        if inner.pending != 0 {
            inner = queue
                .step_done
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.pending
    }

    /// Drain every queue and join the workers. Jobs already submitted
    /// are completed; the call returns when all three threads have
    /// exited.
    pub fn shutdown(mut self) {
        self.request_shutdown();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("background worker exited by panic during shutdown");
            }
        }
    }

    /// Set the flag and wake every worker. The notify happens under
    /// each queue's mutex: a worker is then either before its
    /// flag check (and will see it) or already waiting (and will be
    /// woken), never in between.
    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for queue in self.queues.iter() {
            let _guard = lock_queue(queue);
            queue.new_job.notify_all();
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        // Abnormal teardown: leave the threads to die with the
        // process. Only `shutdown` drains and joins.
        self.request_shutdown();
    }
}

fn worker_loop(kind: JobKind, queue: &QueueState, shutdown: &AtomicBool) {
    block_alarm_signal();

    let mut inner = lock_queue(queue);
    loop {
        while inner.jobs.is_empty() {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            // Spurious wakeups land back in this loop.
            inner = queue
                .new_job
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let queued = inner.jobs.pop_front().expect("queue checked non-empty");
        drop(inner);

        run_job(kind, queued);

        inner = lock_queue(queue);
        inner.pending -= 1;
        queue.step_done.notify_all();
    }
}

fn run_job(kind: JobKind, queued: QueuedJob) {
    if let Ok(age) = queued.created.elapsed() {
        if age.as_secs() >= 1 {
            debug!(kind = kind.name(), age_secs = age.as_secs(), "job sat queued");
        }
    }
    match queued.job {
        Job::CloseFile(file) => {
            // Dropping the handle issues the close; if this was the
            // last reference to an unlinked file, the kernel reclaims
            // the blocks here instead of on the request thread.
            drop(file);
        }
        Job::FsyncFile(file) => {
            if let Err(err) = file.sync_all() {
                // Fire-and-forget contract: log and keep consuming.
                warn!(error = %err, "background fsync failed");
            }
        }
        Job::LazyFree(payload) => {
            drop(payload);
        }
    }
}

/// Keep the periodic alarm signal routed to the main thread only.
#[cfg(unix)]
fn block_alarm_signal() {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!(error = %err, "cannot mask SIGALRM in background worker");
    }
}

#[cfg(not(unix))]
fn block_alarm_signal() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::atomic::AtomicUsize;

    /// Payload that records its drop order in a shared log.
    struct Tracked {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.id);
        }
    }

    fn drain(workers: &BackgroundWorkers, kind: JobKind) {
        while workers.pending(kind) != 0 {
            workers.wait_one(kind);
        }
    }

    #[test]
    fn test_lazy_free_completes_in_submission_order() {
        let workers = BackgroundWorkers::start();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            workers.submit(Job::LazyFree(Box::new(Tracked {
                id,
                log: Arc::clone(&log),
            })));
        }
        drain(&workers, JobKind::LazyFree);

        let order = log.lock().expect("drop log available").clone();
        assert_eq!(order, vec![0, 1, 2], "FIFO within a kind");
        workers.shutdown();
    }

    #[test]
    fn test_pending_drains_to_zero_and_effects_are_visible() {
        let workers = BackgroundWorkers::start();
        let freed = Arc::new(AtomicUsize::new(0));

        struct Bump(Arc<AtomicUsize>);
        impl Drop for Bump {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        for _ in 0..100 {
            workers.submit(Job::LazyFree(Box::new(Bump(Arc::clone(&freed)))));
        }
        drain(&workers, JobKind::LazyFree);

        // pending == 0 implies every destructor has run.
        assert_eq!(freed.load(Ordering::SeqCst), 100);
        workers.shutdown();
    }

    #[test]
    fn test_wait_one_returns_immediately_when_idle() {
        let workers = BackgroundWorkers::start();
        assert_eq!(workers.wait_one(JobKind::CloseFile), 0);
        assert_eq!(workers.pending(JobKind::FsyncFile), 0);
        workers.shutdown();
    }

    #[test]
    fn test_fsync_then_close_file_jobs() {
        let workers = BackgroundWorkers::start();

        let mut file = tempfile::tempfile().expect("temp file should open");
        file.write_all(b"payload").expect("write should succeed");
        let shared = Arc::new(file.try_clone().expect("clone handle"));

        workers.submit(Job::FsyncFile(Arc::clone(&shared)));
        drain(&workers, JobKind::FsyncFile);

        workers.submit(Job::CloseFile(
            file.try_clone().expect("clone handle for close"),
        ));
        drain(&workers, JobKind::CloseFile);

        // The original handle survives the background close of its
        // clone; the data is still there.
        let mut buf = String::new();
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.read_to_string(&mut buf).expect("read back");
        assert_eq!(buf, "payload");
        workers.shutdown();
    }

    #[test]
    fn test_kinds_are_independent_queues() {
        let workers = BackgroundWorkers::start();
        let log = Arc::new(Mutex::new(Vec::new()));

        workers.submit(Job::LazyFree(Box::new(Tracked {
            id: 7,
            log: Arc::clone(&log),
        })));
        // Waiting on a different kind must not be affected by the
        // lazy-free queue.
        assert_eq!(workers.wait_one(JobKind::CloseFile), 0);
        drain(&workers, JobKind::LazyFree);
        assert_eq!(log.lock().expect("drop log").as_slice(), &[7]);
        workers.shutdown();
    }

    #[test]
    fn test_shutdown_drains_submitted_jobs() {
        let workers = BackgroundWorkers::start();
        let freed = Arc::new(AtomicUsize::new(0));

        struct Bump(Arc<AtomicUsize>);
        impl Drop for Bump {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        for _ in 0..50 {
            workers.submit(Job::LazyFree(Box::new(Bump(Arc::clone(&freed)))));
        }
        workers.shutdown();
        assert_eq!(freed.load(Ordering::SeqCst), 50);
    }
}
