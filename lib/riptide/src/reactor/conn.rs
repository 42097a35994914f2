use crate::net::buffer::{RecvBuffer, SendBuffer};
use crate::net::tls::{TlsFlow, TlsSession};
use crate::RoomId;
use ballast::error::{Error, Result};
use hashbrown::HashSet;
use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::Ready;

const RECV_CHUNK: usize = 4096;

pub const DEFAULT_NICKNAME: &str = "guest";

/// Outcome of one receive drain.
#[derive(Debug, Default, Copy, Clone)]
pub struct RecvInfo {
    pub bytes: usize,
    pub closed: bool,
}

/// Everything the reactor owns for one client: the socket (closed on
/// drop), its TLS session, the staged byte buffers, the current poll
/// interest, and the session metadata mutated on behalf of worker
/// commands. Only the reactor thread ever touches a `Connection`.
pub struct Connection {
    stream: TcpStream,
    pub tls: TlsSession,
    pub recv: RecvBuffer,
    pub send: SendBuffer,
    pub interest: Ready,
    pub endpoint: String,
    pub nickname: String,
    pub user_id: String,
    pub joined_rooms: HashSet<RoomId>,
    pub closed: bool,
}

/// Base interest every registered connection keeps: readable plus peer
/// hangup.
#[inline]
pub fn base_interest() -> Ready {
    Ready::readable() | Ready::from(UnixReady::hup())
}

impl Connection {
    pub fn new(stream: TcpStream, tls: TlsSession, endpoint: String, interest: Ready) -> Connection {
        Connection {
            stream,
            tls,
            recv: RecvBuffer::new(),
            send: SendBuffer::new(),
            interest,
            endpoint,
            nickname: DEFAULT_NICKNAME.to_owned(),
            user_id: String::new(),
            joined_rooms: HashSet::new(),
            closed: false,
        }
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// The interest mask this connection should be polled with right now:
    /// write readiness is wanted exactly while bytes are staged or the TLS
    /// session has ciphertext it could not flush.
    pub fn desired_interest(&self) -> Ready {
        let mut next = base_interest();
        if self.send.has_pending() || self.tls.needs_write() {
            next |= Ready::writable();
        }
        next
    }

    /// Advances the TLS handshake one step.
    #[inline]
    pub fn handshake_step(&mut self) -> Result<TlsFlow> {
        let mut sock = &self.stream;
        self.tls.handshake(&mut sock)
    }

    /// Reads everything currently decryptable into the recv buffer.
    pub fn drain_recv(&mut self) -> Result<RecvInfo> {
        let mut info = RecvInfo::default();
        let mut tmp = [0u8; RECV_CHUNK];

        loop {
            let flow = {
                let mut sock = &self.stream;
                self.tls.read(&mut sock, &mut tmp)?
            };

            if flow.bytes > 0 {
                self.recv.append(&tmp[..flow.bytes]);
                info.bytes += flow.bytes;
                if flow.want_read || flow.want_write {
                    return Ok(info);
                }
                continue;
            }

            if flow.closed {
                info.closed = true;
            }
            return Ok(info);
        }
    }

    /// Writes staged bytes through the TLS session until the buffer
    /// drains or the kernel pushes back.
    pub fn flush_send(&mut self) -> Result<usize> {
        let mut sent = 0;

        while self.send.has_pending() {
            let flow = {
                let mut sock = &self.stream;
                let tls = &mut self.tls;
                tls.write(&mut sock, self.send.current_data())?
            };

            if flow.bytes > 0 {
                self.send.advance(flow.bytes);
                sent += flow.bytes;
            }

            if flow.closed {
                return Err(Error::os(libc::EPIPE));
            }
            if flow.want_read || flow.want_write {
                self.send.compact_if_needed();
                return Ok(sent);
            }
            if flow.bytes == 0 {
                return Err(Error::os(libc::EPROTO));
            }
        }

        self.send.clear_if_done();
        Ok(sent)
    }

    /// Best-effort TLS close notification before the descriptor drops.
    pub fn shutdown_tls(&mut self) {
        let mut sock = &self.stream;
        let _ = self.tls.shutdown(&mut sock);
    }

    /// Pending `SO_ERROR` on the socket, if any.
    pub fn take_error(&self) -> Option<i32> {
        match self.stream.take_error() {
            Ok(Some(err)) => Some(err.raw_os_error().unwrap_or(libc::EIO)),
            _ => None,
        }
    }
}
