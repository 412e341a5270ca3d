//! Codec handle management.
//!
//! Archive decoders are stateful and generally unsafe to drive from several
//! threads at once, so every extraction borrows a handle through one of three
//! strategies:
//!
//! - [`SingleHandle`]: one handle for the whole archive, extraction serialized.
//! - [`PerThreadHandles`]: each calling thread lazily gets a private handle.
//! - [`HandlePool`]: idle handles are checked out and returned; an empty pool
//!   opens a new handle instead of blocking.
//!
//! A handle whose operation failed is dropped rather than reused, since the
//! decoder may be left mid-stream. Per-thread handles are dropped when their
//! thread exits.

use crate::Result;
use log::debug;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// How a provider shares codec handles between concurrent extractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStrategy {
    Single,
    PerThread,
    /// Keep at most `max_idle` idle handles around (`None` = unbounded).
    Pooled { max_idle: Option<usize> },
}

impl HandleStrategy {
    /// A pool retaining one idle handle per available CPU.
    pub fn pooled_default() -> Self {
        let max_idle = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        HandleStrategy::Pooled {
            max_idle: Some(max_idle),
        }
    }
}

impl fmt::Display for HandleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleStrategy::Single => write!(f, "single"),
            HandleStrategy::PerThread => write!(f, "per-thread"),
            HandleStrategy::Pooled { max_idle: Some(max) } => write!(f, "pooled(max_idle={})", max),
            HandleStrategy::Pooled { max_idle: None } => write!(f, "pooled(unbounded)"),
        }
    }
}

/// Run `f` on the handle in `slot`, opening one if the slot is empty.
///
/// The handle goes back into the slot only if `f` succeeds.
fn with_slot<H, R, O, F>(slot: &mut Option<H>, opened: &AtomicUsize, open: O, f: F) -> Result<R>
where
    O: FnOnce() -> Result<H>,
    F: FnOnce(&mut H) -> Result<R>,
{
    let mut handle = match slot.take() {
        Some(handle) => handle,
        None => {
            let handle = open()?;
            opened.fetch_add(1, Ordering::Relaxed);
            handle
        }
    };
    let result = f(&mut handle);
    if result.is_ok() {
        *slot = Some(handle);
    }
    result
}

/// A single handle serving every caller in turn.
pub struct SingleHandle<H> {
    handle: Mutex<Option<H>>,
    opened: AtomicUsize,
}

impl<H> Default for SingleHandle<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SingleHandle<H> {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            opened: AtomicUsize::new(0),
        }
    }

    /// Run `f` with exclusive access to the shared handle.
    pub fn with_handle<R, O, F>(&self, open: O, f: F) -> Result<R>
    where
        O: FnOnce() -> Result<H>,
        F: FnOnce(&mut H) -> Result<R>,
    {
        let mut slot = self.handle.lock();
        with_slot(&mut slot, &self.opened, open, f)
    }

    /// Handles opened over the lifetime of this strategy.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

type Slot<H> = Arc<Mutex<Option<H>>>;
type Registry<H> = Mutex<HashMap<ThreadId, Slot<H>>>;

/// Callbacks run when the owning thread's locals are destroyed.
struct ExitHooks(RefCell<Vec<Box<dyn FnOnce()>>>);

impl Drop for ExitHooks {
    fn drop(&mut self) {
        for hook in self.0.take() {
            hook();
        }
    }
}

thread_local! {
    static EXIT_HOOKS: ExitHooks = ExitHooks(RefCell::new(Vec::new()));
}

fn on_thread_exit(hook: Box<dyn FnOnce()>) {
    // Only fails once the thread is already tearing down its locals.
    let _ = EXIT_HOOKS.try_with(|hooks| hooks.0.borrow_mut().push(hook));
}

/// One private handle per calling thread, keyed by thread id.
///
/// A thread's handle is released when the thread exits, or earlier through
/// [`PerThreadHandles::release_current_thread`].
pub struct PerThreadHandles<H> {
    handles: Arc<Registry<H>>,
    opened: AtomicUsize,
}

impl<H: 'static> Default for PerThreadHandles<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: 'static> PerThreadHandles<H> {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            opened: AtomicUsize::new(0),
        }
    }

    /// The current thread's slot, registering it on first use.
    fn slot(&self) -> Slot<H> {
        let id = thread::current().id();
        let mut handles = self.handles.lock();
        match handles.entry(id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let registry: Weak<Registry<H>> = Arc::downgrade(&self.handles);
                on_thread_exit(Box::new(move || {
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    let released = registry.lock().remove(&id);
                    if released.is_some() {
                        debug!("Thread {:?} exited, releasing its codec handle", id);
                    }
                }));
                Arc::clone(entry.insert(Arc::default()))
            }
        }
    }

    /// Run `f` with the current thread's handle, opening it on first use.
    pub fn with_handle<R, O, F>(&self, open: O, f: F) -> Result<R>
    where
        O: FnOnce() -> Result<H>,
        F: FnOnce(&mut H) -> Result<R>,
    {
        let cell = self.slot();
        let mut slot = cell.lock();
        if slot.is_none() {
            debug!("Opening codec handle for thread {:?}", thread::current().id());
        }
        with_slot(&mut slot, &self.opened, open, f)
    }

    /// Drop the current thread's handle, if any.
    pub fn release_current_thread(&self) {
        let released = self.handles.lock().remove(&thread::current().id());
        drop(released);
    }

    /// Number of threads currently holding an open handle.
    pub fn live(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|cell| cell.lock().is_some())
            .count()
    }

    /// Handles opened over the lifetime of this strategy.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

/// A pool of interchangeable handles with explicit checkout and checkin.
pub struct HandlePool<H> {
    idle: Mutex<Vec<H>>,
    max_idle: Option<usize>,
    opened: AtomicUsize,
}

impl<H> HandlePool<H> {
    pub fn new(max_idle: Option<usize>) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            opened: AtomicUsize::new(0),
        }
    }

    /// Take an idle handle, or open a new one if none is idle. Never blocks
    /// waiting for another caller to return a handle.
    pub fn checkout<O>(&self, open: O) -> Result<H>
    where
        O: FnOnce() -> Result<H>,
    {
        let idle = self.idle.lock().pop();
        match idle {
            Some(handle) => Ok(handle),
            None => {
                let handle = open()?;
                let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Pool empty, opened codec handle #{}", opened);
                Ok(handle)
            }
        }
    }

    /// Return a handle. It is dropped if the pool already holds `max_idle`.
    pub fn checkin(&self, handle: H) {
        let mut idle = self.idle.lock();
        if self.max_idle.map_or(true, |max| idle.len() < max) {
            idle.push(handle);
        }
    }

    /// Check out a handle, run `f`, and check it back in on success.
    pub fn with_handle<R, O, F>(&self, open: O, f: F) -> Result<R>
    where
        O: FnOnce() -> Result<H>,
        F: FnOnce(&mut H) -> Result<R>,
    {
        let mut handle = self.checkout(open)?;
        let result = f(&mut handle);
        if result.is_ok() {
            self.checkin(handle);
        }
        result
    }

    /// Handles currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Handles opened over the lifetime of the pool.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

/// The handle strategy of one provider.
pub enum Handles<H> {
    Single(SingleHandle<H>),
    PerThread(PerThreadHandles<H>),
    Pooled(HandlePool<H>),
}

impl<H: 'static> Handles<H> {
    pub fn new(strategy: HandleStrategy) -> Self {
        match strategy {
            HandleStrategy::Single => Handles::Single(SingleHandle::new()),
            HandleStrategy::PerThread => Handles::PerThread(PerThreadHandles::new()),
            HandleStrategy::Pooled { max_idle } => Handles::Pooled(HandlePool::new(max_idle)),
        }
    }

    pub fn strategy(&self) -> HandleStrategy {
        match self {
            Handles::Single(_) => HandleStrategy::Single,
            Handles::PerThread(_) => HandleStrategy::PerThread,
            Handles::Pooled(pool) => HandleStrategy::Pooled {
                max_idle: pool.max_idle,
            },
        }
    }

    pub fn with_handle<R, O, F>(&self, open: O, f: F) -> Result<R>
    where
        O: FnOnce() -> Result<H>,
        F: FnOnce(&mut H) -> Result<R>,
    {
        match self {
            Handles::Single(single) => single.with_handle(open, f),
            Handles::PerThread(per_thread) => per_thread.with_handle(open, f),
            Handles::Pooled(pool) => pool.with_handle(open, f),
        }
    }

    /// Handles opened over the lifetime of this strategy.
    pub fn opened(&self) -> usize {
        match self {
            Handles::Single(single) => single.opened(),
            Handles::PerThread(per_thread) => per_thread.opened(),
            Handles::Pooled(pool) => pool.opened(),
        }
    }
}
