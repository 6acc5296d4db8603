use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{error, trace};

use crate::channel::{Channel, RegState, Revents};
use crate::error::Result;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Level-triggered readiness demultiplexer: one per loop, owned by it and
/// only ever touched from its thread.
///
/// Registration goes through raw descriptors so the same machinery serves
/// listening sockets, connection sockets, and the loop's wakeup descriptor.
/// The token for a descriptor is the descriptor itself.
pub struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
            channels: HashMap::new(),
        })
    }

    /// Block up to `timeout` for readiness and append every channel the OS
    /// reported to `active`, in report order, with its returned events set.
    /// Returns the instant the call woke.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            // A signal landing mid-wait is an empty wakeup, not a failure.
            if e.kind() != io::ErrorKind::Interrupted {
                error!("poll failed: {e}");
            }
            self.events.clear();
            return Instant::now();
        }
        let now = Instant::now();
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(Revents::from(event));
                active.push(channel.clone());
            }
        }
        now
    }

    /// Sync a channel's interest mask with the OS.
    ///
    /// New and previously-deleted channels are (re)registered; an added
    /// channel whose mask went empty has its OS interest withdrawn but stays
    /// in the map until [`Poller::remove_channel`].
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let reg_state = channel.reg_state();
        trace!("update channel fd={fd} state={reg_state:?}");
        match reg_state {
            RegState::New | RegState::Deleted => {
                if reg_state == RegState::New {
                    self.channels.insert(fd, channel.clone());
                }
                if let Some(interest) = channel.interest() {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(fd as usize), interest)
                        .unwrap_or_else(|e| panic!("failed to register fd {fd}: {e}"));
                    channel.set_reg_state(RegState::Added);
                }
            }
            RegState::Added => match channel.interest() {
                Some(interest) => {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                        .unwrap_or_else(|e| panic!("failed to reregister fd {fd}: {e}"));
                }
                None => {
                    if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        error!("failed to deregister fd {fd}: {e}");
                    }
                    channel.set_reg_state(RegState::Deleted);
                }
            },
        }
    }

    /// Forget a channel entirely, withdrawing OS interest if still present.
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("remove channel fd={fd}");
        self.channels.remove(&fd);
        if channel.reg_state() == RegState::Added {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                error!("failed to deregister fd {fd}: {e}");
            }
        }
        channel.set_reg_state(RegState::New);
    }

    /// Identity-checked membership: true only when this very channel is
    /// registered under its descriptor.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |registered| Arc::ptr_eq(registered, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    #[test]
    fn test_register_poll_and_remove() {
        let mut poller = Poller::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let channel = Channel::new(Weak::new(), reader.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);
        assert!(poller.has_channel(&channel));

        writer.write_all(b"x").unwrap();
        let mut active = Vec::new();
        poller.poll(Duration::from_secs(1), &mut active);
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &channel));
        assert!(channel.revents().readable);

        poller.remove_channel(&channel);
        assert!(!poller.has_channel(&channel));
    }

    #[test]
    fn test_empty_interest_withdraws_os_interest() {
        let mut poller = Poller::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let channel = Channel::new(Weak::new(), reader.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);

        channel.disable_all();
        poller.update_channel(&channel);
        // Still tracked, but the OS no longer reports it.
        assert!(poller.has_channel(&channel));

        writer.write_all(b"x").unwrap();
        let mut active = Vec::new();
        poller.poll(Duration::from_millis(50), &mut active);
        assert!(active.is_empty());

        // Re-enabling restores delivery.
        channel.enable_reading();
        poller.update_channel(&channel);
        poller.poll(Duration::from_secs(1), &mut active);
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_has_channel_is_identity_checked() {
        let mut poller = Poller::new().unwrap();
        let (_writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let channel = Channel::new(Weak::new(), reader.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);

        let impostor = Channel::new(Weak::new(), reader.as_raw_fd());
        assert!(poller.has_channel(&channel));
        assert!(!poller.has_channel(&impostor), "same fd, different identity");
    }
}
