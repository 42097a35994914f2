use ballast::error::{Error, Result, TlsKind};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::convert::TryFrom;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Plaintext handed to the TLS layer per write step. Bounding the chunk
/// keeps a kernel-blocked socket surfacing `want_write` instead of the
/// session buffering the whole backlog as ciphertext.
const MAX_PLAIN_CHUNK: usize = 16 * 1024;

/// Outcome of one TLS I/O step. `want_read`/`want_write` mean the session
/// can make no further progress until the kernel reports the matching
/// readiness; the caller rewrites its interest mask and suspends. A
/// non-zero `bytes` combined with a `want_*` flag is legitimate partial
/// progress.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TlsFlow {
    pub bytes: usize,
    pub closed: bool,
    pub want_read: bool,
    pub want_write: bool,
}

impl TlsFlow {
    #[inline]
    fn closed() -> TlsFlow {
        TlsFlow {
            closed: true,
            ..TlsFlow::default()
        }
    }

    #[inline]
    fn want_read() -> TlsFlow {
        TlsFlow {
            want_read: true,
            ..TlsFlow::default()
        }
    }

    #[inline]
    fn want_write() -> TlsFlow {
        TlsFlow {
            want_write: true,
            ..TlsFlow::default()
        }
    }
}

/// Per-process TLS configuration, created once per role at startup.
/// Cloning shares the underlying rustls config.
#[derive(Clone)]
pub enum TlsContext {
    Server(Arc<ServerConfig>),
    Client(Arc<ClientConfig>),
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| Error::Tls(TlsKind::Load, format!("open {}: {}", path.display(), err)))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Tls(TlsKind::Load, err.to_string()))?;

    if certs.is_empty() {
        return Err(Error::Tls(
            TlsKind::Load,
            format!("no certificates in {}", path.display()),
        ));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| Error::Tls(TlsKind::Load, format!("open {}: {}", path.display(), err)))?;

    match rustls_pemfile::private_key(&mut BufReader::new(file)) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(Error::Tls(
            TlsKind::Load,
            format!("no private key in {}", path.display()),
        )),
        Err(err) => Err(Error::Tls(TlsKind::Load, err.to_string())),
    }
}

impl TlsContext {
    /// Server-role context: loads the certificate chain and private key
    /// from PEM files. Key/chain agreement is validated during config
    /// construction.
    pub fn new_server(cert_chain: &Path, private_key: &Path) -> Result<TlsContext> {
        let certs = read_cert_chain(cert_chain)?;
        let key = read_private_key(private_key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| Error::Tls(TlsKind::Context, err.to_string()))?;

        Ok(TlsContext::Server(Arc::new(config)))
    }

    /// Client-role context with peer verification against either a
    /// specific CA bundle or the bundled trust roots.
    pub fn new_client(ca_file: Option<&Path>) -> Result<TlsContext> {
        let mut roots = RootCertStore::empty();

        match ca_file {
            Some(path) => {
                let certs = read_cert_chain(path)?;
                let (added, _) = roots.add_parsable_certificates(certs);
                if added == 0 {
                    return Err(Error::Tls(
                        TlsKind::Load,
                        format!("no usable CA certificates in {}", path.display()),
                    ));
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsContext::Client(Arc::new(config)))
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, TlsContext::Server(_))
    }

    /// A fresh session in server-accept state.
    pub fn server_session(&self) -> Result<TlsSession> {
        let config = match self {
            TlsContext::Server(config) => config.clone(),
            TlsContext::Client(_) => return Err(Error::os(libc::EINVAL)),
        };

        let conn = ServerConnection::new(config)
            .map_err(|err| Error::Tls(TlsKind::Context, err.to_string()))?;
        Ok(TlsSession::new(conn.into()))
    }

    /// A fresh session in client-connect state. `server_name` drives SNI
    /// and hostname verification.
    pub fn client_session(&self, server_name: &str) -> Result<TlsSession> {
        let config = match self {
            TlsContext::Client(config) => config.clone(),
            TlsContext::Server(_) => return Err(Error::os(libc::EINVAL)),
        };

        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::Tls(TlsKind::Context, format!("invalid server name {}", server_name)))?;

        let conn = ClientConnection::new(config, name)
            .map_err(|err| Error::Tls(TlsKind::Context, err.to_string()))?;
        Ok(TlsSession::new(conn.into()))
    }
}

/// One TLS session over one underlying socket. All operations are
/// nonblocking single steps reporting a `TlsFlow`; the session keeps its
/// internal buffers across `want_*` suspensions.
pub struct TlsSession {
    conn: rustls::Connection,
    handshake_done: bool,
    want_read: bool,
    want_write: bool,
    peer_closed: bool,
    close_notify_sent: bool,
}

impl TlsSession {
    fn new(conn: rustls::Connection) -> TlsSession {
        TlsSession {
            conn,
            handshake_done: false,
            want_read: false,
            want_write: false,
            peer_closed: false,
            close_notify_sent: false,
        }
    }

    #[inline]
    fn apply(&mut self, flow: TlsFlow) -> TlsFlow {
        self.want_read = flow.want_read;
        self.want_write = flow.want_write;
        if flow.closed {
            self.peer_closed = true;
        }
        flow
    }

    /// Advances the handshake as far as the socket allows. Safe to call
    /// again after completion; traffic is forbidden until `done` holds.
    pub fn handshake<S: Read + Write>(&mut self, sock: &mut S) -> Result<TlsFlow> {
        if self.handshake_done {
            return Ok(self.apply(TlsFlow::default()));
        }

        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(0) => return Err(Error::os(libc::EPIPE)),
                    Ok(_) => continue,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(self.apply(TlsFlow::want_write()));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(Error::from_io(&err)),
                }
            }

            if !self.conn.is_handshaking() {
                break;
            }

            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(self.apply(TlsFlow::closed())),
                Ok(_) => {
                    if let Err(err) = self.conn.process_new_packets() {
                        // Flush the pending alert before reporting.
                        let _ = self.conn.write_tls(sock);
                        return Err(Error::Tls(TlsKind::Handshake, err.to_string()));
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.apply(TlsFlow::want_read()));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }
        }

        self.handshake_done = true;

        // The final flight may still be queued as ciphertext.
        let mut flow = TlsFlow::default();
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Err(Error::os(libc::EPIPE)),
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    flow.want_write = true;
                    break;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }
        }
        Ok(self.apply(flow))
    }

    /// One read step: serves decrypted plaintext into `dst`, pulling
    /// ciphertext off the socket when none is buffered. Transport EOF is
    /// indistinguishable from a graceful close and reported as `closed`.
    pub fn read<S: Read + Write>(&mut self, sock: &mut S, dst: &mut [u8]) -> Result<TlsFlow> {
        if dst.is_empty() {
            return Ok(self.apply(TlsFlow::default()));
        }

        match self.conn.reader().read(dst) {
            Ok(0) => return Ok(self.apply(TlsFlow::closed())),
            Ok(n) => {
                return Ok(self.apply(TlsFlow {
                    bytes: n,
                    ..TlsFlow::default()
                }))
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(self.apply(TlsFlow::closed()));
            }
            Err(err) => return Err(Error::from_io(&err)),
        }

        match self.conn.read_tls(sock) {
            Ok(0) => return Ok(self.apply(TlsFlow::closed())),
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(self.apply(TlsFlow::want_read()));
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(self.apply(TlsFlow::want_read()));
            }
            Err(err) => return Err(Error::from_io(&err)),
        }

        if let Err(err) = self.conn.process_new_packets() {
            let _ = self.conn.write_tls(sock);
            return Err(Error::Tls(TlsKind::Protocol, err.to_string()));
        }

        match self.conn.reader().read(dst) {
            Ok(0) => Ok(self.apply(TlsFlow::closed())),
            Ok(n) => Ok(self.apply(TlsFlow {
                bytes: n,
                ..TlsFlow::default()
            })),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Only part of a record has arrived.
                Ok(self.apply(TlsFlow::want_read()))
            }
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Ok(self.apply(TlsFlow::closed()))
            }
            Err(err) => Err(Error::from_io(&err)),
        }
    }

    /// One write step: encrypts a bounded chunk of `src` and flushes as
    /// much ciphertext as the socket accepts. `bytes` counts plaintext
    /// consumed from `src`.
    pub fn write<S: Write>(&mut self, sock: &mut S, src: &[u8]) -> Result<TlsFlow> {
        if src.is_empty() {
            return Ok(self.apply(TlsFlow::default()));
        }

        let chunk = &src[..src.len().min(MAX_PLAIN_CHUNK)];
        let bytes = self
            .conn
            .writer()
            .write(chunk)
            .map_err(|err| Error::from_io(&err))?;

        let mut flow = TlsFlow {
            bytes,
            ..TlsFlow::default()
        };

        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Err(Error::os(libc::EPIPE)),
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    flow.want_write = true;
                    break;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }
        }

        Ok(self.apply(flow))
    }

    /// Best-effort close notification. Succeeds whether the notify was
    /// flushed or the socket is already unwritable; the descriptor is
    /// about to be dropped either way.
    pub fn shutdown<S: Write>(&mut self, sock: &mut S) -> Result<()> {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }

        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }
        }

        Ok(())
    }

    /// Confirms the peer presented a certificate. Chain and hostname
    /// checks already ran inside the handshake; clients call this exactly
    /// once after the handshake completes.
    pub fn verify_peer(&self) -> Result<()> {
        match self.conn.peer_certificates() {
            Some(certs) if !certs.is_empty() => Ok(()),
            _ => Err(Error::Tls(TlsKind::Verify, "no peer certificate".to_owned())),
        }
    }

    #[inline]
    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    #[inline]
    pub fn needs_read(&self) -> bool {
        self.want_read
    }

    /// True while the session holds ciphertext it could not flush or
    /// reported a kernel write block.
    #[inline]
    pub fn needs_write(&self) -> bool {
        self.want_write || self.conn.wants_write()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.peer_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts every write, never has bytes to read.
    struct SinkSock;

    impl Read for SinkSock {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for SinkSock {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Refuses writes with WouldBlock, never has bytes to read.
    struct BlockedSock;

    impl Read for BlockedSock {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for BlockedSock {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_session() -> TlsSession {
        let ctx = TlsContext::new_client(None).unwrap();
        ctx.client_session("localhost").unwrap()
    }

    #[test]
    fn test_handshake_suspends_on_want_read() {
        let mut session = client_session();
        let mut sock = SinkSock;

        // The hello flight drains into the sink, then the session waits
        // for the server's reply.
        let flow = session.handshake(&mut sock).unwrap();
        assert!(flow.want_read);
        assert!(!flow.closed);
        assert!(!session.is_handshake_done());
        assert!(session.needs_read());
    }

    #[test]
    fn test_handshake_suspends_on_want_write() {
        let mut session = client_session();
        let mut sock = BlockedSock;

        let flow = session.handshake(&mut sock).unwrap();
        assert!(flow.want_write);
        assert!(session.needs_write());
        assert!(!session.is_handshake_done());
    }

    #[test]
    fn test_handshake_peer_eof_reads_as_closed() {
        struct EofSock;

        impl Read for EofSock {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }

        impl Write for EofSock {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut session = client_session();
        let flow = session.handshake(&mut EofSock).unwrap();
        assert!(flow.closed);
        assert!(session.is_closed());
    }

    #[test]
    fn test_shutdown_on_unestablished_session_is_silent() {
        let mut session = client_session();
        session.shutdown(&mut SinkSock).unwrap();

        // Repeat shutdown stays successful; the notify is queued once.
        session.shutdown(&mut BlockedSock).unwrap();
    }

    #[test]
    fn test_verify_peer_without_certificate_fails() {
        let session = client_session();
        let err = session.verify_peer().unwrap_err();
        assert!(matches!(err, Error::Tls(TlsKind::Verify, _)));
    }

    #[test]
    fn test_server_session_from_client_context_is_invalid() {
        let ctx = TlsContext::new_client(None).unwrap();
        assert!(!ctx.is_server());
        assert!(ctx.server_session().is_err());
    }
}
