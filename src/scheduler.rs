//! "Run this somewhere else" primitive and the ambient scheduler context.
//!
//! 「在别处运行」原语以及环境调度上下文。
//!
//! Drive steps and captured continuations never run on the caller's stack;
//! they are handed to a [`Scheduler`]. Tasks run by the schedulers in this
//! module [`enter`] their scheduler first, so a continuation registered from
//! inside one of them can [`capture`] it and be resumed there later.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};

use crossbeam_queue::SegQueue;
use tokio::runtime::Handle;

/// Unit of work handed to a [`Scheduler`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks on some worker other than the current call stack
///
/// 在当前调用栈之外的某个工作者上执行任务
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(self: Arc<Self>, task: Task);
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn Scheduler>>> = const { RefCell::new(None) };
}

/// Restores the previous ambient scheduler when dropped
#[must_use = "the scheduler context is left as soon as the guard is dropped"]
pub struct EnterGuard {
    prev: Option<Arc<dyn Scheduler>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterGuard").finish_non_exhaustive()
    }
}

/// Make `scheduler` the ambient context of this thread until the guard drops
pub fn enter(scheduler: Arc<dyn Scheduler>) -> EnterGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(scheduler));
    EnterGuard { prev }
}

/// The ambient scheduler of this thread, if any
pub fn capture() -> Option<Arc<dyn Scheduler>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Whether `scheduler` is the ambient context of this thread
pub fn is_current(scheduler: &Arc<dyn Scheduler>) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|cur| same_scheduler(cur, scheduler))
    })
}

#[inline]
fn same_scheduler(a: &Arc<dyn Scheduler>, b: &Arc<dyn Scheduler>) -> bool {
    // Compare data pointers only, vtables may be duplicated across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Scheduler used when a cursor is not given one explicitly
///
/// The ambient context if one is entered, otherwise the current tokio
/// runtime, otherwise a process-wide [`ThreadScheduler`].
///
/// 默认调度器：优先环境上下文，其次当前 tokio 运行时，最后是进程级 [`ThreadScheduler`]。
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    if let Some(current) = capture() {
        return current;
    }
    if let Some(tokio) = TokioScheduler::current() {
        return tokio;
    }
    static FALLBACK: OnceLock<Arc<ThreadScheduler>> = OnceLock::new();
    FALLBACK
        .get_or_init(|| ThreadScheduler::spawn("series-sync-worker"))
        .clone()
}

#[inline]
fn in_context(scheduler: Arc<dyn Scheduler>, task: Task) -> impl FnOnce() + Send + 'static {
    move || {
        let _enter = enter(scheduler);
        task();
    }
}

/// Spawns tasks on a tokio runtime
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self { handle })
    }

    /// Scheduler for the runtime this thread is running in, if any
    pub fn current() -> Option<Arc<Self>> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(self: Arc<Self>, task: Task) {
        let handle = self.handle.clone();
        let run = in_context(self, task);
        handle.spawn(async move { run() });
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}

/// Single dedicated worker thread draining a lock-free task queue
///
/// 单个专用工作线程，消费无锁任务队列
pub struct ThreadScheduler {
    shared: Arc<WorkerShared>,
    worker: Thread,
}

struct WorkerShared {
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
}

impl ThreadScheduler {
    /// Start the worker thread.
    ///
    /// # Panics
    /// If the OS refuses to spawn a thread.
    pub fn spawn(name: &str) -> Arc<Self> {
        let shared = Arc::new(WorkerShared {
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(worker_shared))
            .unwrap_or_else(|err| panic!("failed to spawn scheduler thread: {}", err));

        Arc::new(Self {
            shared,
            worker: handle.thread().clone(),
        })
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    loop {
        while let Some(task) = shared.queue.pop() {
            task();
        }
        if shared.shutdown.load(Ordering::Acquire) && shared.queue.is_empty() {
            break;
        }
        thread::park();
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(self: Arc<Self>, task: Task) {
        let worker = self.worker.clone();
        let shared = self.shared.clone();
        shared.queue.push(Box::new(in_context(self, task)));
        worker.unpark();
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.worker.unpark();
    }
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
