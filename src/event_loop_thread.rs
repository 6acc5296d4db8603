use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use tracing::debug;

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

/// One OS thread hosting exactly one event loop.
///
/// The loop is constructed on the spawned thread (the loop's owning thread
/// is always the thread that runs it) and a handle is passed back to the
/// spawner. Dropping the wrapper quits the loop and joins the thread.
pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: &str) -> Result<EventLoopThread> {
        let (tx, rx) = mpsc::channel();
        let thread = Builder::new()
            .name(name.to_string())
            .spawn(move || match EventLoop::new() {
                Ok(event_loop) => {
                    tx.send(Ok(event_loop.clone())).ok();
                    event_loop.run();
                }
                Err(e) => {
                    tx.send(Err(e)).ok();
                }
            })
            .map_err(Error::Io)?;

        let event_loop = rx.recv().map_err(|_| Error::LoopGone)??;
        Ok(EventLoopThread {
            event_loop,
            thread: Some(thread),
        })
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A main loop plus a fixed set of sub-loop threads, handed out round-robin.
///
/// With zero threads every connection shares the base loop; the acceptor
/// always stays on the base loop either way.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of sub-loop threads to spawn; must be set before `start`.
    pub fn set_thread_num(&self, num: usize) {
        self.num_threads.store(num, Ordering::SeqCst);
    }

    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let num = self.num_threads.load(Ordering::SeqCst);
        debug!("EventLoopThreadPool [{}] starting {num} io threads", self.name);
        for i in 0..num {
            let thread = EventLoopThread::start(&format!("{}-io-{i}", self.name))?;
            self.loops.lock().unwrap().push(thread.event_loop());
            self.threads.lock().unwrap().push(thread);
        }
        Ok(())
    }

    /// Next sub loop, round-robin; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst) % loops.len();
        loops[index].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
