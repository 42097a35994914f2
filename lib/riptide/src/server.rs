use crate::exec::db_pool::DbExecutor;
use crate::exec::pool::WorkerPool;
use crate::net::addr;
use crate::net::tls::TlsContext;
use crate::protocol::codec::{self, Command};
use crate::reactor::acceptor::Acceptor;
use crate::reactor::event_loop::{EventHandler, EventLoop};
use crate::reactor::registry::{Registry, RegistryHandle};
use crate::store::ChatStore;
use crate::ConnId;
use ballast::error::{Error, Result};
use ballast::logging::{self, Logger};
use ballast::stop::{StopSource, StopToken};
use mio::unix::UnixReady;
use mio::Ready;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

const DB_POOL_SIZE: usize = 2;
const WORKER_POOL_SIZE: usize = 2;

struct ExitState {
    stopped: bool,
    error: Option<Error>,
}

type ExitLatch = Arc<(Mutex<ExitState>, Condvar)>;

/// Records the first terminating condition and wakes the supervisor.
fn signal_exit(latch: &ExitLatch, error: Option<Error>) {
    let (lock, cv) = &**latch;
    let mut state = lock.lock().expect("exit latch poisoned");
    if state.error.is_none() {
        state.error = error;
    }
    state.stopped = true;
    cv.notify_one();
}

/// The server facade: owns the registry, the acceptor, and the executor
/// pools, and supervises the reactor + acceptor threads until the first
/// terminating condition.
pub struct ChatServer {
    registry: Registry,
    acceptor: Acceptor,
    store: Arc<dyn ChatStore>,
    log: Logger,
}

impl ChatServer {
    /// Resolves the listen address, binds the listener, and builds the
    /// registry around the TLS context (captured to mint per-connection
    /// sessions).
    pub fn create(
        port: u16,
        store: Arc<dyn ChatStore>,
        tls: TlsContext,
        log: &Logger,
    ) -> Result<ChatServer> {
        let candidates = addr::resolve_server(port)?;
        let listener = addr::bind_listener(&candidates)?;

        let log = log.new(logging::o!("component" => "server"));
        let registry = Registry::new(tls, &log)?;
        let acceptor = Acceptor::new(listener, registry.handle(), &log)?;

        let listen_addr = acceptor.local_addr()?;
        logging::info!(log, "listening"; "addr" => %listen_addr);
        Ok(ChatServer {
            registry,
            acceptor,
            store,
            log,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn run(self) -> Result<()> {
        let source = StopSource::new();
        self.run_with(source.token())
    }

    /// Launches the acceptor and reactor threads and blocks until either
    /// one terminates or the external stop token fires; then stops both
    /// loops (firing their wakeups), joins them, and drains the pools.
    /// The first error wins.
    pub fn run_with(self, stop: StopToken) -> Result<()> {
        let ChatServer {
            mut registry,
            mut acceptor,
            store,
            log,
        } = self;

        let lifecycle = StopSource::new();
        let latch: ExitLatch = Arc::new((
            Mutex::new(ExitState {
                stopped: false,
                error: None,
            }),
            Condvar::new(),
        ));

        {
            let latch = latch.clone();
            stop.on_stop(move || signal_exit(&latch, None));
        }

        let handle = registry.handle();
        let db_pool = Arc::new(DbExecutor::new(
            DB_POOL_SIZE,
            store,
            handle.clone(),
            lifecycle.token(),
            &log,
        ));
        let pool = Arc::new(WorkerPool::new(
            WORKER_POOL_SIZE,
            handle.clone(),
            lifecycle.token(),
            &log,
        ));

        let accept_thread = {
            let latch = latch.clone();
            let token = lifecycle.token();
            let log = log.clone();
            thread::spawn(move || match acceptor.run(&token) {
                Ok(()) => signal_exit(&latch, None),
                Err(err) => {
                    logging::error!(log, "acceptor thread error"; "error" => %err);
                    signal_exit(&latch, Some(err));
                }
            })
        };

        let reactor_thread = {
            let latch = latch.clone();
            let token = lifecycle.token();
            let log = log.clone();
            let mut handler = ServerHandler {
                handle,
                db_pool: db_pool.clone(),
                pool: pool.clone(),
                log: log.clone(),
            };
            thread::spawn(move || {
                let mut event_loop = EventLoop::new();
                match event_loop.run(&mut registry, &token, &mut handler) {
                    Ok(()) => signal_exit(&latch, None),
                    Err(err) => {
                        logging::error!(log, "reactor thread error"; "error" => %err);
                        signal_exit(&latch, Some(err));
                    }
                }
            })
        };

        {
            let (lock, cv) = &*latch;
            let mut state = lock.lock().expect("exit latch poisoned");
            while !state.stopped {
                state = cv.wait(state).expect("exit latch poisoned");
            }
        }

        lifecycle.request_stop();
        let _ = accept_thread.join();
        let _ = reactor_thread.join();
        pool.stop();
        db_pool.stop();

        let mut state = latch.0.lock().expect("exit latch poisoned");
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Per-connection dispatch bound into the reactor loop.
struct ServerHandler {
    handle: Arc<RegistryHandle>,
    db_pool: Arc<DbExecutor>,
    pool: Arc<WorkerPool>,
    log: Logger,
}

impl ServerHandler {
    /// Immediate removal after an I/O failure, with a best-effort TLS
    /// close notification first.
    fn teardown(&self, registry: &mut Registry, fd: ConnId) {
        if let Some(conn) = registry.find(fd) {
            conn.shutdown_tls();
        }
        registry.unregister(fd);
    }

    /// Graceful peer close. The latch keeps a connection that fires
    /// several readiness events from queueing duplicate teardowns.
    fn handle_close(&self, registry: &mut Registry, fd: ConnId) {
        if let Some(conn) = registry.find(fd) {
            if conn.closed {
                return;
            }
            conn.closed = true;
            logging::debug!(self.log, "peer closed"; "endpoint" => &conn.endpoint);
            conn.shutdown_tls();
        }
        self.handle.request_unregister(fd);
    }

    /// Drives handshake progress. Returns false when the connection was
    /// torn down; `done` in the Ok case tells the caller whether regular
    /// traffic may proceed now.
    fn drive_handshake(&self, registry: &mut Registry, fd: ConnId) -> Option<bool> {
        let step = match registry.find(fd) {
            Some(conn) if !conn.tls.is_handshake_done() => conn.handshake_step(),
            Some(_) => return Some(true),
            None => return None,
        };

        match step {
            Err(err) => {
                logging::warn!(self.log, "handshake failed"; "fd" => fd, "error" => %err);
                self.teardown(registry, fd);
                None
            }
            Ok(flow) => {
                if flow.closed {
                    self.handle_close(registry, fd);
                    return None;
                }

                let done = match registry.find(fd) {
                    Some(conn) => {
                        conn.interest = conn.desired_interest();
                        conn.tls.is_handshake_done()
                    }
                    None => return None,
                };

                if registry.sync_interest(fd).is_err() {
                    return None;
                }
                Some(done)
            }
        }
    }
}

impl EventHandler for ServerHandler {
    fn on_recv(&mut self, registry: &mut Registry, fd: ConnId, ready: Ready) -> bool {
        match self.drive_handshake(registry, fd) {
            None => return false,
            Some(false) => return true,
            Some(true) => {}
        }

        let (drained, endpoint) = match registry.find(fd) {
            Some(conn) => (conn.drain_recv(), conn.endpoint.clone()),
            None => return false,
        };

        match drained {
            Err(err) => {
                logging::warn!(self.log, "recv failed"; "endpoint" => &endpoint, "error" => %err);
                self.teardown(registry, fd);
                false
            }
            Ok(info) => {
                if info.bytes > 0 {
                    logging::debug!(
                        self.log,
                        "{} sends {} {}",
                        endpoint,
                        info.bytes,
                        if info.bytes == 1 { "byte" } else { "bytes" }
                    );
                }

                // The session may want write readiness now.
                if let Some(conn) = registry.find(fd) {
                    conn.interest = conn.desired_interest();
                }
                if registry.sync_interest(fd).is_err() {
                    return false;
                }

                if info.closed || UnixReady::from(ready).is_hup() {
                    self.handle_close(registry, fd);
                    return false;
                }
                true
            }
        }
    }

    fn on_send(&mut self, registry: &mut Registry, fd: ConnId) {
        match self.drive_handshake(registry, fd) {
            None | Some(false) => return,
            Some(true) => {}
        }

        let (flushed, endpoint) = match registry.find(fd) {
            Some(conn) => (conn.flush_send(), conn.endpoint.clone()),
            None => return,
        };

        match flushed {
            Err(err) => {
                logging::warn!(self.log, "send failed"; "endpoint" => &endpoint, "error" => %err);
                self.teardown(registry, fd);
            }
            Ok(sent) => {
                if sent > 0 {
                    logging::debug!(
                        self.log,
                        "{} receives {} {}",
                        endpoint,
                        sent,
                        if sent == 1 { "byte" } else { "bytes" }
                    );
                }

                // Write interest is dropped once nothing is pending and
                // the session has no ciphertext left.
                if let Some(conn) = registry.find(fd) {
                    conn.interest = conn.desired_interest();
                }
                let _ = registry.sync_interest(fd);
            }
        }
    }

    fn on_execute(&mut self, registry: &mut Registry, fd: ConnId) -> bool {
        let (line, user_id) = match registry.find(fd) {
            Some(conn) => {
                if !conn.tls.is_handshake_done() {
                    return false;
                }
                match conn.recv.next_line() {
                    Some(line) => (line, conn.user_id.clone()),
                    None => return false,
                }
            }
            None => return false,
        };

        let cmd = match codec::decode(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                // The offending line is skipped; the connection stays up.
                logging::warn!(self.log, "decode failed"; "fd" => fd, "error" => %err);
                return true;
            }
        };

        if DbExecutor::is_db_command(&cmd) {
            self.db_pool.enqueue(cmd, fd, user_id);
            return true;
        }
        if WorkerPool::is_pool_command(&cmd) {
            self.pool.enqueue(cmd, fd);
            return true;
        }

        match cmd {
            Command::Say { text, .. } => self.handle.request_broadcast(fd, Command::response(text)),
            Command::Nick { nick } => self.handle.request_change_nickname(fd, nick),
            Command::Response { text } => self.handle.request_send(fd, Command::response(text)),
            _ => {}
        }
        true
    }

    fn on_client_error(&mut self, registry: &mut Registry, fd: ConnId, _ready: Ready) {
        if let Some(conn) = registry.find(fd) {
            conn.shutdown_tls();
            let code = conn.take_error().unwrap_or(0);
            logging::warn!(self.log, "client socket error";
                           "endpoint" => &conn.endpoint, "code" => code);
        }
        self.handle.request_unregister(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rustls::pki_types::ServerName;
    use std::convert::TryFrom;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn cert_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../certs")
    }

    fn server_ctx() -> TlsContext {
        let dir = cert_dir();
        TlsContext::new_server(&dir.join("server.crt.pem"), &dir.join("server.key.pem")).unwrap()
    }

    /// The listener binds a wildcard address; dial loopback at its port.
    fn loopback(server: &ChatServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()))
    }

    /// Blocking TLS test client speaking the wire protocol.
    struct TestClient {
        conn: rustls::ClientConnection,
        sock: StdStream,
        buf: Vec<u8>,
    }

    impl TestClient {
        fn connect(addr: SocketAddr) -> TestClient {
            let config = match TlsContext::new_client(Some(&cert_dir().join("ca.crt.pem"))).unwrap()
            {
                TlsContext::Client(config) => config,
                TlsContext::Server(_) => unreachable!(),
            };

            let name = ServerName::try_from("localhost").unwrap();
            let conn = rustls::ClientConnection::new(config, name).unwrap();
            let sock = StdStream::connect(addr).unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

            TestClient {
                conn,
                sock,
                buf: Vec::new(),
            }
        }

        fn send_line(&mut self, line: &str) {
            let mut stream = rustls::Stream::new(&mut self.conn, &mut self.sock);
            stream.write_all(line.as_bytes()).unwrap();
        }

        fn read_line(&mut self) -> String {
            loop {
                if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.buf.drain(..=pos).collect();
                    return String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                }

                let mut tmp = [0u8; 4096];
                let mut stream = rustls::Stream::new(&mut self.conn, &mut self.sock);
                let n = stream.read(&mut tmp).unwrap();
                assert!(n > 0, "peer closed while a line was expected");
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }

        fn roundtrip(&mut self, line: &str) -> String {
            self.send_line(line);
            self.read_line()
        }
    }

    #[test]
    fn test_chat_session_end_to_end() {
        let log = ballast::logging::discard();
        let store = Arc::new(MemoryStore::new());
        let server = ChatServer::create(0, store, server_ctx(), &log).unwrap();
        let addr = loopback(&server);

        let stop = StopSource::new();
        let token = stop.token();
        let server_thread = thread::spawn(move || server.run_with(token));

        let mut alice = TestClient::connect(addr);
        let mut bob = TestClient::connect(addr);

        // Account setup.
        assert_eq!(
            alice.roundtrip("register\ralice\rpw\n"),
            "response\rregister success"
        );
        assert_eq!(
            bob.roundtrip("register\rbob\rpw\n"),
            "response\rregister success"
        );
        assert_eq!(
            alice.roundtrip("login\ralice\rpw\n"),
            "response\rlogin success"
        );
        assert_eq!(bob.roundtrip("login\rbob\rpw\n"), "response\rlogin success");

        // Room + friendship + invite.
        assert_eq!(
            alice.roundtrip("create_room\rlobby\n"),
            "response\rroom created: 1 (lobby)"
        );
        assert_eq!(
            alice.roundtrip("friend_request\rbob\n"),
            "response\rfriend request sent"
        );
        assert_eq!(
            bob.roundtrip("friend_accept\ralice\n"),
            "response\rfriend request accepted"
        );
        assert_eq!(
            alice.roundtrip("invite_room\r1\rbob\n"),
            "response\rroom invite sent: room=1 user=bob"
        );

        // Named broadcast reaches every room member, sender included.
        assert_eq!(
            alice.roundtrip("nick\rada\n"),
            "response\rnick change success"
        );
        assert_eq!(alice.roundtrip("say\r1\rhello\n"), "response\rada: hello");
        assert_eq!(bob.read_line(), "response\rada: hello");

        // A malformed line is skipped without killing the session.
        assert_eq!(
            bob.roundtrip("teleport\rhome\nlist_room\n"),
            "response\rrooms: 1"
        );
        assert_eq!(
            bob.read_line(),
            "response\rroom: id=1 name=lobby owner=alice members=2"
        );

        // History was persisted through the say path.
        assert_eq!(
            bob.roundtrip("history\r1\r10\n"),
            "response\rhistory: room=1 count=1"
        );
        let row = bob.read_line();
        assert!(row.starts_with("response\rhistory: id=1 "), "row = {}", row);
        assert!(row.ends_with("from=alice text=hello"), "row = {}", row);

        // Alice drops without a TLS shutdown; bob's next room message
        // still reaches bob himself.
        drop(alice);
        assert_eq!(
            bob.roundtrip("say\r1\rstill here\n"),
            "response\rguest: still here"
        );

        stop.request_stop();
        server_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_server_stops_cleanly_with_idle_clients() {
        let log = ballast::logging::discard();
        let store = Arc::new(MemoryStore::new());
        let server = ChatServer::create(0, store, server_ctx(), &log).unwrap();
        let addr = loopback(&server);

        let stop = StopSource::new();
        let token = stop.token();
        let server_thread = thread::spawn(move || server.run_with(token));

        let mut client = TestClient::connect(addr);
        assert_eq!(
            client.roundtrip("register\rcarol\rpw\n"),
            "response\rregister success"
        );

        stop.request_stop();
        server_thread.join().unwrap().unwrap();
    }
}
