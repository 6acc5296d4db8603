use std::cell::Cell;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::error::Result;
use crate::poller::Poller;

/// How long one poller wait may block when nothing is ready. A quit flag set
/// without a wakeup is still observed within this bound.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Functor = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    // At most one loop per thread.
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Thread-affine event dispatcher: drives the poller, dispatches channel
/// events, and executes work items queued from other threads.
///
/// All channel and poller mutation happens on the owning thread. The only
/// legal cross-thread entry points are [`EventLoop::run_in_loop`],
/// [`EventLoop::queue_in_loop`], [`EventLoop::quit`], and
/// [`EventLoop::wakeup`]; everything else must run on the loop thread.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poller: Mutex<Poller>,
    poll_return_time: Mutex<Instant>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Functor>>,
}

fn create_event_fd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<Arc<EventLoop>> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
            flag.set(true);
        });

        let poller = Poller::new()?;
        let wakeup_fd = create_event_fd()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poller: Mutex::new(poller),
            poll_return_time: Mutex::new(Instant::now()),
            wakeup_channel: Channel::new(weak.clone(), wakeup_raw),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup_read();
            }
        });
        event_loop.wakeup_channel.enable_reading();

        debug!("EventLoop created on {:?}", event_loop.thread_id);
        Ok(event_loop)
    }

    /// Run until [`EventLoop::quit`]. Must be called on the owning thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);
        debug!("EventLoop starts looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::SeqCst) {
            active.clear();
            let wake_time = self
                .poller
                .lock()
                .unwrap()
                .poll(DEFAULT_POLL_TIMEOUT, &mut active);
            *self.poll_return_time.lock().unwrap() = wake_time;
            for channel in &active {
                channel.handle_event(wake_time);
            }
            self.do_pending_functors();
        }

        debug!("EventLoop stops looping");
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to stop after the current iteration. Callable from any
    /// thread; an off-thread caller also wakes the poller so the loop does
    /// not sleep out its full timeout first.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Execute `f` on the loop thread: in place when already there,
    /// otherwise via the pending queue.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for the next drain of the pending queue.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Box::new(f));
        }
        // The drain condition matters as much as the cross-thread one: work
        // queued by a functor currently being drained would otherwise sit
        // behind a full poll timeout.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Break the poller out of its wait by bumping the eventfd counter.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            error!("wakeup write returned {n} bytes instead of 8");
        }
    }

    fn handle_wakeup_read(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut one as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            error!("wakeup read returned {n} bytes instead of 8");
        }
        trace!("wakeup drained counter {one}");
    }

    fn do_pending_functors(&self) {
        self.calling_pending.store(true, Ordering::SeqCst);
        // Swap out under the lock, run with it released: O(1) critical
        // section, and functors may queue more work without deadlocking.
        let functors: Vec<Functor> = {
            let mut pending = self.pending.lock().unwrap();
            mem::take(&mut *pending)
        };
        for functor in functors {
            functor();
        }
        self.calling_pending.store(false, Ordering::SeqCst);
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by {:?} was used from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    /// Instant at which the poller last woke.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock().unwrap()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The final reference may be dropped on another thread; only release
        // the guard belonging to the owning thread.
        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}
