use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use mio::Interest;

use crate::event_loop::EventLoop;

pub type ReadEventCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Readiness reported by the poller for one descriptor.
///
/// `hangup` is the peer-hangup condition; combined with `readable` it decides
/// whether the close callback fires ahead of everything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revents {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
    pub priority: bool,
}

impl From<&mio::event::Event> for Revents {
    fn from(event: &mio::event::Event) -> Self {
        Revents {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() && event.is_write_closed(),
            error: event.is_error(),
            priority: event.is_priority(),
        }
    }
}

/// Where the channel currently stands with its loop's poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegState {
    /// Never handed to the poller.
    New,
    /// In the poller map with live OS interest.
    Added,
    /// In the poller map, OS interest withdrawn.
    Deleted,
}

struct Inner {
    read_interest: bool,
    write_interest: bool,
    revents: Revents,
    reg_state: RegState,
    /// Non-owning observation of the owner object, promoted to a strong
    /// handle for the duration of one dispatch.
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadEventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

/// Binds one descriptor to its interest set, the events the poller reported
/// for it, and the four handler callbacks. A channel never owns its
/// descriptor and is itself owned by exactly one higher-level object (the
/// connection, the acceptor, or the loop's wakeup handle).
pub struct Channel {
    fd: RawFd,
    owner_loop: Weak<EventLoop>,
    inner: Mutex<Inner>,
}

impl Channel {
    pub(crate) fn new(owner_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            owner_loop,
            inner: Mutex::new(Inner {
                read_interest: false,
                write_interest: false,
                revents: Revents::default(),
                reg_state: RegState::New,
                tie: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().read_cb = Some(Arc::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().write_cb = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().close_cb = Some(Arc::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().error_cb = Some(Arc::new(cb));
    }

    /// Observe `owner` weakly; every subsequent dispatch promotes the
    /// observation and skips the handlers if the owner is already gone.
    pub fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().unwrap().tie = Some(Arc::downgrade(&owner));
    }

    pub fn is_reading(&self) -> bool {
        self.inner.lock().unwrap().read_interest
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().unwrap().write_interest
    }

    pub fn is_none_event(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.read_interest && !inner.write_interest
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().read_interest = true;
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().read_interest = false;
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().write_interest = true;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().write_interest = false;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.read_interest = false;
            inner.write_interest = false;
        }
        self.update();
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.owner_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Unregister from the owning loop's poller.
    pub fn remove(self: &Arc<Self>) {
        if let Some(event_loop) = self.owner_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    /// The interest mask as the poller sees it; `None` means no events.
    pub(crate) fn interest(&self) -> Option<Interest> {
        let inner = self.inner.lock().unwrap();
        match (inner.read_interest, inner.write_interest) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn reg_state(&self) -> RegState {
        self.inner.lock().unwrap().reg_state
    }

    pub(crate) fn set_reg_state(&self, state: RegState) {
        self.inner.lock().unwrap().reg_state = state;
    }

    pub(crate) fn set_revents(&self, revents: Revents) {
        self.inner.lock().unwrap().revents = revents;
    }

    pub fn revents(&self) -> Revents {
        self.inner.lock().unwrap().revents
    }

    /// Invoked by the owning loop for each poller-reported event.
    pub fn handle_event(&self, receive_time: Instant) {
        // Snapshot under the lock, dispatch outside it: handlers are free to
        // change interest on this same channel.
        let (revents, guard, read_cb, write_cb, close_cb, error_cb) = {
            let inner = self.inner.lock().unwrap();
            let guard = match &inner.tie {
                Some(tie) => match tie.upgrade() {
                    Some(strong) => Some(strong),
                    // Owner destroyed; its handlers must not run.
                    None => return,
                },
                None => None,
            };
            (
                inner.revents,
                guard,
                inner.read_cb.clone(),
                inner.write_cb.clone(),
                inner.close_cb.clone(),
                inner.error_cb.clone(),
            )
        };

        if revents.hangup && !revents.readable {
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents.error {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents.readable || revents.priority {
            if let Some(cb) = &read_cb {
                cb(receive_time);
            }
        }
        if revents.writable {
            if let Some(cb) = &write_cb {
                cb();
            }
        }

        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn logging_channel(log: &Arc<StdMutex<Vec<&'static str>>>) -> Arc<Channel> {
        let channel = Channel::new(Weak::new(), -1);
        let l = log.clone();
        channel.set_read_callback(move |_| l.lock().unwrap().push("read"));
        let l = log.clone();
        channel.set_write_callback(move || l.lock().unwrap().push("write"));
        let l = log.clone();
        channel.set_close_callback(move || l.lock().unwrap().push("close"));
        let l = log.clone();
        channel.set_error_callback(move || l.lock().unwrap().push("error"));
        channel
    }

    fn dispatch(revents: Revents) -> Vec<&'static str> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let channel = logging_channel(&log);
        channel.set_revents(revents);
        channel.handle_event(Instant::now());
        let out = log.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_dispatch_order_over_event_subsets() {
        // Single conditions.
        assert_eq!(dispatch(Revents { readable: true, ..Default::default() }), ["read"]);
        assert_eq!(dispatch(Revents { writable: true, ..Default::default() }), ["write"]);
        assert_eq!(dispatch(Revents { error: true, ..Default::default() }), ["error"]);
        assert_eq!(dispatch(Revents { priority: true, ..Default::default() }), ["read"]);
        assert_eq!(dispatch(Revents { hangup: true, ..Default::default() }), ["close"]);

        // Hangup with pending data defers to the read path.
        assert_eq!(
            dispatch(Revents { hangup: true, readable: true, ..Default::default() }),
            ["read"]
        );

        // Fixed order: close, error, read, write.
        assert_eq!(
            dispatch(Revents { hangup: true, error: true, ..Default::default() }),
            ["close", "error"]
        );
        assert_eq!(
            dispatch(Revents { readable: true, writable: true, error: true, ..Default::default() }),
            ["error", "read", "write"]
        );
        assert_eq!(
            dispatch(Revents {
                readable: true,
                writable: true,
                hangup: true,
                error: true,
                priority: false,
            }),
            ["error", "read", "write"]
        );
    }

    #[test]
    fn test_interest_mask_transitions() {
        let channel = Channel::new(Weak::new(), -1);
        assert!(channel.is_none_event());
        assert_eq!(channel.interest(), None);

        channel.enable_reading();
        assert!(channel.is_reading());
        assert_eq!(channel.interest(), Some(Interest::READABLE));

        channel.enable_writing();
        assert!(channel.is_writing());
        assert_eq!(channel.interest(), Some(Interest::READABLE | Interest::WRITABLE));

        channel.disable_reading();
        assert_eq!(channel.interest(), Some(Interest::WRITABLE));

        channel.disable_all();
        assert!(channel.is_none_event());
        assert_eq!(channel.interest(), None);
    }

    #[test]
    fn test_tied_dispatch_skipped_after_owner_drop() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let channel = logging_channel(&log);
        channel.set_revents(Revents { readable: true, ..Default::default() });

        let owner: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        channel.tie(owner.clone());
        channel.handle_event(Instant::now());
        assert_eq!(*log.lock().unwrap(), ["read"], "live owner dispatches");

        drop(owner);
        channel.handle_event(Instant::now());
        assert_eq!(*log.lock().unwrap(), ["read"], "dead owner skips dispatch");
    }
}
