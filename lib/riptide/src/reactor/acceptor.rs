use crate::net::wakeup::{Wakeup, WakeupHandle};
use crate::reactor::conn::base_interest;
use crate::reactor::registry::RegistryHandle;
use ballast::error::{Error, Result};
use ballast::logging::{self, Logger};
use ballast::stop::StopToken;
use mio::net::TcpListener;
use mio::unix::UnixReady;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::sync::Arc;

const LISTENER_TOKEN: Token = Token(0);
const WAKEUP_TOKEN: Token = Token(1);

/// Accepts new connections on its own poll set and hands each descriptor
/// to the registry. Never touches a `Connection`; its wakeup exists only
/// to break the loop out of `poll` at shutdown.
pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    wakeup: Wakeup,
    handle: Arc<RegistryHandle>,
    events: Events,
    log: Logger,
}

impl Acceptor {
    pub fn new(listener: TcpListener, handle: Arc<RegistryHandle>, log: &Logger) -> Result<Acceptor> {
        let poll = Poll::new().map_err(|err| Error::from_io(&err))?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::level())
            .map_err(|err| Error::from_io(&err))?;

        let wakeup = Wakeup::new();
        wakeup.register(&poll, WAKEUP_TOKEN)?;

        Ok(Acceptor {
            poll,
            listener,
            wakeup,
            handle,
            events: Events::with_capacity(64),
            log: log.new(logging::o!("component" => "acceptor")),
        })
    }

    #[inline]
    pub fn wakeup_handle(&self) -> WakeupHandle {
        self.wakeup.handle()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(|err| Error::from_io(&err))
    }

    pub fn run(&mut self, stop: &StopToken) -> Result<()> {
        let waker = self.wakeup_handle();
        stop.on_stop(move || waker.request_wakeup());

        while !stop.is_stop_requested() {
            match self.poll.poll(&mut self.events, None) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }

            for event in &self.events {
                let ready = event.readiness();

                if event.token() == WAKEUP_TOKEN {
                    self.wakeup.consume_wakeup();
                    continue;
                }

                if event.token() != LISTENER_TOKEN {
                    continue;
                }

                if UnixReady::from(ready).is_error() || UnixReady::from(ready).is_hup() {
                    return Err(self.listener_error());
                }

                self.accept_pending();
            }
        }

        Ok(())
    }

    /// Listener errors are fatal to the server; `SO_ERROR` names the cause
    /// when the kernel kept one.
    fn listener_error(&self) -> Error {
        match self.listener.take_error() {
            Ok(Some(err)) => Error::from_io(&err),
            _ => Error::os(libc::EIO),
        }
    }

    /// Accepts until the listener would block; interrupts are retried.
    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    logging::debug!(self.log, "connection accepted"; "endpoint" => %peer);
                    self.handle.request_register(stream, base_interest());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %Error::from_io(&err));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr;
    use crate::net::tls::TlsContext;
    use crate::reactor::registry::Registry;
    use std::net::TcpStream as StdStream;
    use std::path::Path;
    use std::thread;

    fn server_ctx() -> TlsContext {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../certs");
        TlsContext::new_server(&dir.join("server.crt.pem"), &dir.join("server.key.pem")).unwrap()
    }

    #[test]
    fn test_acceptor_hands_connections_to_registry() {
        let log = ballast::logging::discard();
        let mut registry = Registry::new(server_ctx(), &log).unwrap();

        let candidates = addr::resolve_client("127.0.0.1", 0).unwrap();
        let listener = addr::bind_listener(&candidates).unwrap();
        let local = listener.local_addr().unwrap();

        let mut acceptor = Acceptor::new(listener, registry.handle(), &log).unwrap();
        let waker = acceptor.wakeup_handle();

        let stop = ballast::stop::StopSource::new();
        let token = stop.token();
        let accept_thread = thread::spawn(move || acceptor.run(&token));

        let _client = StdStream::connect(local).unwrap();

        // The registration lands in the registry queue; drain it here on
        // the reactor side.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while registry.len() == 0 {
            assert!(std::time::Instant::now() < deadline, "no registration arrived");
            registry.work();
            thread::yield_now();
        }
        assert_eq!(registry.len(), 1);

        stop.request_stop();
        waker.request_wakeup();
        accept_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_acceptor_stops_on_request() {
        let log = ballast::logging::discard();
        let registry = Registry::new(server_ctx(), &log).unwrap();

        let candidates = addr::resolve_client("127.0.0.1", 0).unwrap();
        let listener = addr::bind_listener(&candidates).unwrap();

        let mut acceptor = Acceptor::new(listener, registry.handle(), &log).unwrap();
        let stop = ballast::stop::StopSource::new();
        let token = stop.token();

        let accept_thread = thread::spawn(move || acceptor.run(&token));
        stop.request_stop();
        accept_thread.join().unwrap().unwrap();
    }
}
