use crate::net::addr;
use crate::net::buffer::RecvBuffer;
use crate::net::tls::TlsContext;
use crate::protocol::codec::{self, Command};
use crate::reactor::conn::{base_interest, Connection};
use ballast::error::{Error, Result, TlsKind};
use ballast::logging::{self, Logger};
use ballast::stop::StopToken;
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;

const SOCKET_TOKEN: Token = Token(0);
const STDIN_TOKEN: Token = Token(1);
const STDIN_CHUNK: usize = 1024;

/// Maps one console input line to a protocol command. The leading `/` is
/// optional; free-text arguments (say bodies, room names) take the rest
/// of the line.
pub fn parse_input(line: &str) -> Option<Command> {
    let line = line.strip_prefix('/').unwrap_or(line);
    let mut parts = line.splitn(2, char::is_whitespace);
    let tag = parts.next()?;
    let rest = parts.next().unwrap_or("").trim();

    fn one(rest: &str) -> Option<String> {
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }

    fn two(rest: &str) -> Option<(String, String)> {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let first = parts.next().filter(|part| !part.is_empty())?;
        let second = parts.next().map(str::trim).filter(|part| !part.is_empty())?;
        Some((first.to_owned(), second.to_owned()))
    }

    fn none(rest: &str) -> Option<()> {
        if rest.is_empty() {
            Some(())
        } else {
            None
        }
    }

    let cmd = match tag {
        "say" => {
            let (room_id, text) = two(rest)?;
            Command::Say { room_id, text }
        }
        "nick" => Command::Nick { nick: one(rest)? },
        "login" => {
            let (id, pw) = two(rest)?;
            Command::Login { id, pw }
        }
        "register" => {
            let (id, pw) = two(rest)?;
            Command::Register { id, pw }
        }
        "friend_request" => Command::FriendRequest {
            to_user_id: one(rest)?,
        },
        "friend_accept" => Command::FriendAccept {
            from_user_id: one(rest)?,
        },
        "friend_reject" => Command::FriendReject {
            from_user_id: one(rest)?,
        },
        "friend_remove" => Command::FriendRemove {
            friend_user_id: one(rest)?,
        },
        "list_friend" => {
            none(rest)?;
            Command::ListFriend
        }
        "list_friend_request" => {
            none(rest)?;
            Command::ListFriendRequest
        }
        "create_room" => Command::CreateRoom {
            room_name: one(rest)?,
        },
        "delete_room" => Command::DeleteRoom { room_id: one(rest)? },
        "invite_room" => {
            let (room_id, friend_user_id) = two(rest)?;
            Command::InviteRoom {
                room_id,
                friend_user_id,
            }
        }
        "leave_room" => Command::LeaveRoom { room_id: one(rest)? },
        "list_room" => {
            none(rest)?;
            Command::ListRoom
        }
        "history" => {
            let (room_id, limit) = two(rest)?;
            Command::History { room_id, limit }
        }
        _ => return None,
    };

    Some(cmd)
}

/// Interactive client worker: completes the TLS handshake, verifies the
/// peer, then multiplexes stdin commands and server responses over one
/// poll set. `run` returning Ok means a clean stdin EOF or peer close.
pub struct ChatClient {
    conn: Connection,
    stdin_buf: RecvBuffer,
    log: Logger,
}

impl ChatClient {
    pub fn connect(host: &str, port: u16, tls: &TlsContext, log: &Logger) -> Result<ChatClient> {
        let candidates = addr::resolve_client(host, port)?;
        let sock = addr::connect_stream(&candidates)?;
        sock.set_nonblocking(true)?;

        let endpoint = match sock.peer_addr() {
            Ok(peer) => addr::format_endpoint(&peer),
            Err(err) => return Err(Error::from_io(&err)),
        };

        let stream = mio::net::TcpStream::from_stream(sock)?;
        let session = tls.client_session(host)?;
        let conn = Connection::new(stream, session, endpoint, base_interest());

        Ok(ChatClient {
            conn,
            stdin_buf: RecvBuffer::new(),
            log: log.new(logging::o!("component" => "client")),
        })
    }

    pub fn run(&mut self, stop: &StopToken) -> Result<()> {
        let poll = Poll::new()?;
        poll.register(
            self.conn.stream(),
            SOCKET_TOKEN,
            self.conn.interest,
            PollOpt::level(),
        )?;

        self.handshake(&poll, stop)?;
        self.conn.tls.verify_peer()?;
        logging::debug!(self.log, "session established"; "endpoint" => &self.conn.endpoint);

        // Stdin joins the poll set only once traffic is allowed.
        let stdin_fd = libc::STDIN_FILENO;
        poll.register(
            &EventedFd(&stdin_fd),
            STDIN_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )?;

        let mut events = Events::with_capacity(64);
        while !stop.is_stop_requested() {
            match poll.poll(&mut events, None) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }

            for event in &events {
                let ready = event.readiness();
                match event.token() {
                    STDIN_TOKEN => {
                        if self.pump_stdin()? {
                            return Ok(());
                        }
                    }
                    SOCKET_TOKEN => {
                        if UnixReady::from(ready).is_error() {
                            return Err(self.socket_error());
                        }
                        if ready.is_writable() {
                            self.conn.flush_send()?;
                        }
                        if ready.is_readable() || UnixReady::from(ready).is_hup() {
                            if self.pump_socket()? {
                                return Ok(());
                            }
                        }
                    }
                    _ => {}
                }
            }

            self.conn.interest = self.conn.desired_interest();
            poll.reregister(
                self.conn.stream(),
                SOCKET_TOKEN,
                self.conn.interest,
                PollOpt::level(),
            )?;
        }

        Ok(())
    }

    fn handshake(&mut self, poll: &Poll, stop: &StopToken) -> Result<()> {
        let mut events = Events::with_capacity(8);

        loop {
            let flow = self.conn.handshake_step()?;
            if self.conn.tls.is_handshake_done() {
                return Ok(());
            }
            if flow.closed {
                return Err(Error::Tls(
                    TlsKind::Handshake,
                    "peer closed during handshake".to_owned(),
                ));
            }

            self.conn.interest = self.conn.desired_interest();
            poll.reregister(
                self.conn.stream(),
                SOCKET_TOKEN,
                self.conn.interest,
                PollOpt::level(),
            )?;

            match poll.poll(&mut events, None) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&err)),
            }

            if stop.is_stop_requested() {
                return Err(Error::os(libc::ECANCELED));
            }
        }
    }

    /// Reads available console input and flushes complete commands.
    /// Returns true on stdin EOF.
    fn pump_stdin(&mut self) -> Result<bool> {
        let mut tmp = [0u8; STDIN_CHUNK];
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                tmp.as_mut_ptr() as *mut libc::c_void,
                tmp.len(),
            )
        };

        if n == 0 {
            return Ok(true);
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::from_io(&err));
        }

        self.stdin_buf.append(&tmp[..n as usize]);
        while let Some(line) = self.stdin_buf.next_line() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match parse_input(trimmed) {
                Some(cmd) => {
                    self.conn.send.append(codec::encode(&cmd).as_bytes());
                    self.conn.flush_send()?;
                }
                None => println!("unknown command: {}", trimmed),
            }
        }
        Ok(false)
    }

    /// Drains the socket and prints decoded responses. Returns true when
    /// the peer closed.
    fn pump_socket(&mut self) -> Result<bool> {
        let info = self.conn.drain_recv()?;

        while let Some(line) = self.conn.recv.next_line() {
            match codec::decode(&line) {
                Ok(Command::Response { text }) => println!("{}", text),
                Ok(_) => {}
                Err(err) => {
                    logging::warn!(self.log, "decode failed"; "error" => %err);
                }
            }
        }

        Ok(info.closed)
    }

    fn socket_error(&self) -> Error {
        Error::os(self.conn.take_error().unwrap_or(libc::EIO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slash_commands() {
        assert_eq!(
            parse_input("/say 1 hello out there").unwrap(),
            Command::Say {
                room_id: "1".into(),
                text: "hello out there".into(),
            }
        );
        assert_eq!(
            parse_input("/login alice pw").unwrap(),
            Command::Login {
                id: "alice".into(),
                pw: "pw".into(),
            }
        );
        assert_eq!(parse_input("/list_room").unwrap(), Command::ListRoom);
        assert_eq!(
            parse_input("/create_room the big lobby").unwrap(),
            Command::CreateRoom {
                room_name: "the big lobby".into(),
            }
        );
    }

    #[test]
    fn test_parse_without_slash() {
        assert_eq!(
            parse_input("nick ada").unwrap(),
            Command::Nick { nick: "ada".into() }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(parse_input("/teleport home"), None);
        assert_eq!(parse_input("/say 1"), None);
        assert_eq!(parse_input("/nick"), None);
        assert_eq!(parse_input("/list_room extra"), None);
        assert_eq!(parse_input("/history 1"), None);
    }

    #[test]
    fn test_parse_history_arguments() {
        assert_eq!(
            parse_input("/history 3 50").unwrap(),
            Command::History {
                room_id: "3".into(),
                limit: "50".into(),
            }
        );
    }
}
