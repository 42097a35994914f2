use crate::reactor::registry::{Registry, WAKEUP_TOKEN};
use crate::ConnId;
use ballast::error::{Error, Result};
use ballast::stop::StopToken;
use mio::unix::UnixReady;
use mio::{Events, Ready};
use std::io;

/// The per-connection callbacks the server facade supplies to the reactor
/// loop. `on_recv` returning false means the connection was torn down and
/// the rest of the dispatch for that descriptor must be skipped;
/// `on_execute` returns true while it consumed a complete line.
pub trait EventHandler {
    fn on_recv(&mut self, registry: &mut Registry, fd: ConnId, ready: Ready) -> bool;
    fn on_send(&mut self, registry: &mut Registry, fd: ConnId);
    fn on_execute(&mut self, registry: &mut Registry, fd: ConnId) -> bool;
    fn on_client_error(&mut self, registry: &mut Registry, fd: ConnId, ready: Ready);
}

#[inline]
fn is_read_event(ready: Ready) -> bool {
    ready.is_readable() || UnixReady::from(ready).is_hup()
}

#[inline]
fn is_error_event(ready: Ready) -> bool {
    UnixReady::from(ready).is_error()
}

/// The reactor loop over the registry's poll set.
pub struct EventLoop {
    events: Events,
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop {
            events: Events::with_capacity(1024),
        }
    }

    /// Runs until the stop token fires or the poll set fails. Queued
    /// registry commands are applied on every wakeup regardless of which
    /// descriptors fired; the wakeup itself is the signal.
    pub fn run<H: EventHandler>(
        &mut self,
        registry: &mut Registry,
        stop: &StopToken,
        handler: &mut H,
    ) -> Result<()> {
        let waker = registry.handle();
        stop.on_stop(move || waker.request_wakeup());

        while !stop.is_stop_requested() {
            match registry.poll_wait(&mut self.events, None) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }

            registry.work();
            if stop.is_stop_requested() {
                break;
            }

            for event in &self.events {
                let token = event.token();
                if token == WAKEUP_TOKEN {
                    continue;
                }

                let ready = event.readiness();
                let fd = token.0 as ConnId;

                if is_error_event(ready) {
                    handler.on_client_error(registry, fd, ready);
                    continue;
                }

                // Unregistered mid-batch by an earlier command.
                if !registry.contains(fd) {
                    continue;
                }

                let read_event = is_read_event(ready);
                if read_event && !handler.on_recv(registry, fd, ready) {
                    continue;
                }

                if ready.is_writable() {
                    handler.on_send(registry, fd);
                }

                if read_event {
                    while handler.on_execute(registry, fd) {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_classification() {
        assert!(is_read_event(Ready::readable()));
        assert!(is_read_event(Ready::from(UnixReady::hup())));
        assert!(!is_read_event(Ready::writable()));

        assert!(is_error_event(Ready::from(UnixReady::error())));
        assert!(!is_error_event(Ready::readable() | Ready::writable()));
    }
}
