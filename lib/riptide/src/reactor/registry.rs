use crate::net::tls::TlsContext;
use crate::net::addr;
use crate::net::wakeup::{Wakeup, WakeupHandle};
use crate::protocol::codec::{self, Command};
use crate::reactor::conn::Connection;
use crate::{ConnId, RoomId};
use ballast::error::{Error, Result};
use ballast::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::TcpStream;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Token the registry's wakeup is registered under. Connection tokens are
/// raw descriptors, which never reach this range.
pub const WAKEUP_TOKEN: Token = Token(usize::max_value() - 1);

/// A command addressed to the registry. Constructed on any thread,
/// enqueued under the handle's mutex, drained and consumed by the reactor
/// thread. Every variant carries only identifiers and owned payloads.
pub enum RegistryCommand {
    Register(TcpStream, Ready),
    Unregister(ConnId),
    SendTo(ConnId, Command),
    Broadcast(ConnId, Command),
    ChangeNickname(ConnId, String),
    SetUserId(ConnId, String),
    SetJoinedRooms(ConnId, Vec<RoomId>),
    SetJoinedRoomsForUser(String, Vec<RoomId>),
    SendFriendList(ConnId, Vec<String>),
    RoomBroadcast(ConnId, RoomId, Command),
}

/// The cross-thread face of the registry: a FIFO command queue plus the
/// wakeup that interrupts the reactor's poll. Every `request_*` pushes one
/// command and fires the wakeup; no caller ever touches a `Connection`.
pub struct RegistryHandle {
    queue: Mutex<VecDeque<RegistryCommand>>,
    waker: WakeupHandle,
}

impl RegistryHandle {
    fn new(waker: WakeupHandle) -> RegistryHandle {
        RegistryHandle {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    fn push(&self, cmd: RegistryCommand) {
        {
            let mut queue = self.queue.lock().expect("registry queue lock poisoned");
            queue.push_back(cmd);
        }
        self.waker.request_wakeup();
    }

    /// Swaps out everything queued so far. Reactor thread only.
    pub(crate) fn take_pending(&self) -> VecDeque<RegistryCommand> {
        let mut queue = self.queue.lock().expect("registry queue lock poisoned");
        std::mem::take(&mut *queue)
    }

    #[inline]
    pub fn request_wakeup(&self) {
        self.waker.request_wakeup();
    }

    pub fn request_register(&self, stream: TcpStream, interest: Ready) {
        self.push(RegistryCommand::Register(stream, interest));
    }

    pub fn request_unregister(&self, fd: ConnId) {
        self.push(RegistryCommand::Unregister(fd));
    }

    pub fn request_send(&self, fd: ConnId, cmd: Command) {
        self.push(RegistryCommand::SendTo(fd, cmd));
    }

    pub fn request_broadcast(&self, sender_fd: ConnId, cmd: Command) {
        self.push(RegistryCommand::Broadcast(sender_fd, cmd));
    }

    pub fn request_change_nickname(&self, fd: ConnId, nick: String) {
        self.push(RegistryCommand::ChangeNickname(fd, nick));
    }

    pub fn request_set_user_id(&self, fd: ConnId, user_id: String) {
        self.push(RegistryCommand::SetUserId(fd, user_id));
    }

    pub fn request_set_joined_rooms(&self, fd: ConnId, room_ids: Vec<RoomId>) {
        self.push(RegistryCommand::SetJoinedRooms(fd, room_ids));
    }

    pub fn request_set_joined_rooms_for_user(&self, user_id: String, room_ids: Vec<RoomId>) {
        self.push(RegistryCommand::SetJoinedRoomsForUser(user_id, room_ids));
    }

    pub fn request_send_friend_list(&self, fd: ConnId, friends: Vec<String>) {
        self.push(RegistryCommand::SendFriendList(fd, friends));
    }

    pub fn request_room_broadcast(&self, sender_fd: ConnId, room_id: RoomId, cmd: Command) {
        self.push(RegistryCommand::RoomBroadcast(sender_fd, room_id, cmd));
    }
}

/// Owns every connection, the poll set they are registered with, and the
/// room/user indices used for fan-out. The reactor thread is the sole
/// mutator; worker threads reach it through the [`RegistryHandle`].
pub struct Registry {
    poll: Poll,
    wakeup: Wakeup,
    handle: Arc<RegistryHandle>,
    conns: HashMap<ConnId, Connection>,
    rooms: HashMap<RoomId, IndexSet<ConnId>>,
    users: HashMap<String, IndexSet<ConnId>>,
    tls: TlsContext,
    log: Logger,
}

impl Registry {
    /// Builds the registry around its own poll set, with the wakeup
    /// already registered. The TLS context is captured to mint one server
    /// session per accepted connection.
    pub fn new(tls: TlsContext, log: &Logger) -> Result<Registry> {
        let poll = Poll::new().map_err(|err| Error::from_io(&err))?;
        let wakeup = Wakeup::new();
        wakeup.register(&poll, WAKEUP_TOKEN)?;
        let handle = Arc::new(RegistryHandle::new(wakeup.handle()));

        Ok(Registry {
            poll,
            wakeup,
            handle,
            conns: HashMap::new(),
            rooms: HashMap::new(),
            users: HashMap::new(),
            tls,
            log: log.new(logging::o!("component" => "registry")),
        })
    }

    #[inline]
    pub fn handle(&self) -> Arc<RegistryHandle> {
        self.handle.clone()
    }

    /// Blocks on the poll set. Reactor thread only.
    pub(crate) fn poll_wait(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> std::io::Result<usize> {
        self.poll.poll(events, timeout)
    }

    #[inline]
    pub fn find(&mut self, fd: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&fd)
    }

    #[inline]
    pub fn contains(&self, fd: ConnId) -> bool {
        self.conns.contains_key(&fd)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Descriptors currently indexed under a room.
    pub fn room_members(&self, room_id: RoomId) -> Vec<ConnId> {
        match self.rooms.get(&room_id) {
            Some(members) => members.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Descriptors of a user's concurrent sessions.
    pub fn user_sessions(&self, user_id: &str) -> Vec<ConnId> {
        match self.users.get(user_id) {
            Some(sessions) => sessions.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Drains the wakeup and applies every queued command in FIFO order.
    /// Command handlers never fail the reactor; a connection that cannot
    /// be serviced is unregistered.
    pub fn work(&mut self) {
        self.wakeup.consume_wakeup();

        let pending = self.handle.take_pending();
        for cmd in pending {
            self.apply(cmd);
        }
    }

    fn apply(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register(stream, interest) => {
                if let Err(err) = self.register_fd(stream, interest) {
                    logging::error!(self.log, "register failed"; "error" => %err);
                }
            }
            RegistryCommand::Unregister(fd) => self.unregister_fd(fd),
            RegistryCommand::SendTo(fd, cmd) => {
                if self.conns.contains_key(&fd) {
                    let line = codec::encode(&cmd);
                    let _ = self.append_send(fd, line.as_bytes());
                }
            }
            RegistryCommand::Broadcast(sender_fd, cmd) => {
                let line = codec::encode(&self.named_payload(sender_fd, cmd));
                let targets: Vec<ConnId> = self.conns.keys().copied().collect();
                for fd in targets {
                    let _ = self.append_send(fd, line.as_bytes());
                }
            }
            RegistryCommand::RoomBroadcast(sender_fd, room_id, cmd) => {
                let line = codec::encode(&self.named_payload(sender_fd, cmd));
                for fd in self.room_members(room_id) {
                    let _ = self.append_send(fd, line.as_bytes());
                }
            }
            RegistryCommand::ChangeNickname(fd, nick) => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.nickname = nick;
                }
            }
            RegistryCommand::SetUserId(fd, user_id) => self.set_user_id(fd, user_id),
            RegistryCommand::SetJoinedRooms(fd, room_ids) => self.set_joined_rooms(fd, &room_ids),
            RegistryCommand::SetJoinedRoomsForUser(user_id, room_ids) => {
                for fd in self.user_sessions(&user_id) {
                    self.set_joined_rooms(fd, &room_ids);
                }
            }
            RegistryCommand::SendFriendList(fd, friends) => self.send_friend_list(fd, &friends),
        }
    }

    /// Validates and adopts a freshly accepted descriptor: captures the
    /// peer endpoint, registers poll interest, and creates the TLS session
    /// in server-accept state.
    fn register_fd(&mut self, stream: TcpStream, interest: Ready) -> Result<ConnId> {
        let fd = stream.as_raw_fd();
        if fd < 0 {
            return Err(Error::os(libc::EINVAL));
        }
        if self.conns.contains_key(&fd) {
            return Err(Error::os(libc::EEXIST));
        }

        let endpoint = match stream.peer_addr() {
            Ok(peer) => addr::format_endpoint(&peer),
            Err(err) => return Err(Error::from_io(&err)),
        };

        self.poll
            .register(&stream, Token(fd as usize), interest, PollOpt::level())
            .map_err(|err| Error::from_io(&err))?;

        let tls = match self.tls.server_session() {
            Ok(tls) => tls,
            Err(err) => {
                let _ = self.poll.deregister(&stream);
                return Err(err);
            }
        };

        let conn = Connection::new(stream, tls, endpoint, interest);
        logging::info!(self.log, "client connected";
                       "endpoint" => &conn.endpoint,
                       "clients" => self.conns.len() + 1);
        self.conns.insert(fd, conn);
        Ok(fd)
    }

    /// Removes a connection: poll deregistration (tolerating an already
    /// dead descriptor), index maintenance, then the map entry; dropping
    /// the entry closes the descriptor.
    fn unregister_fd(&mut self, fd: ConnId) {
        let conn = match self.conns.remove(&fd) {
            Some(conn) => conn,
            None => return,
        };

        if let Err(err) = self.poll.deregister(conn.stream()) {
            let code = err.raw_os_error().unwrap_or(0);
            if code != libc::ENOENT && code != libc::EBADF {
                logging::warn!(self.log, "poll deregistration failed";
                               "endpoint" => &conn.endpoint,
                               "error" => %Error::from_io(&err));
            }
        }

        for room_id in &conn.joined_rooms {
            if let Some(members) = self.rooms.get_mut(room_id) {
                members.remove(&fd);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }

        if !conn.user_id.is_empty() {
            if let Some(sessions) = self.users.get_mut(&conn.user_id) {
                sessions.remove(&fd);
                if sessions.is_empty() {
                    self.users.remove(&conn.user_id);
                }
            }
        }

        logging::info!(self.log, "client disconnected";
                       "endpoint" => &conn.endpoint,
                       "clients" => self.conns.len());
    }

    /// Public unregister for the reactor-thread handlers; per-connection
    /// I/O failures remove the connection immediately.
    pub fn unregister(&mut self, fd: ConnId) {
        self.unregister_fd(fd);
    }

    /// Re-asserts the connection's current interest mask with the poll
    /// set. Failure unregisters the connection and reports the error.
    pub fn sync_interest(&mut self, fd: ConnId) -> Result<()> {
        let result = match self.conns.get(&fd) {
            Some(conn) => self
                .poll
                .reregister(conn.stream(), Token(fd as usize), conn.interest, PollOpt::level()),
            None => return Ok(()),
        };

        if let Err(err) = result {
            let err = Error::from_io(&err);
            logging::warn!(self.log, "interest update failed";
                           "fd" => fd, "error" => %err);
            self.unregister_fd(fd);
            return Err(err);
        }
        Ok(())
    }

    /// Stages bytes on one connection, requesting write readiness when the
    /// buffer transitions from empty to pending.
    fn append_send(&mut self, fd: ConnId, line: &[u8]) -> Result<()> {
        let needs_write_interest = match self.conns.get_mut(&fd) {
            Some(conn) => {
                let transitioned = conn.send.append(line);
                if transitioned {
                    conn.interest |= Ready::writable();
                }
                transitioned
            }
            None => return Ok(()),
        };

        if needs_write_interest {
            self.sync_interest(fd)?;
        }
        Ok(())
    }

    /// Response payloads fan out with the sender's nickname prefixed;
    /// everything else is forwarded untouched.
    fn named_payload(&self, sender_fd: ConnId, cmd: Command) -> Command {
        match cmd {
            Command::Response { text } => {
                let nickname = self
                    .conns
                    .get(&sender_fd)
                    .filter(|conn| !conn.nickname.is_empty())
                    .map(|conn| conn.nickname.as_str())
                    .unwrap_or(crate::reactor::conn::DEFAULT_NICKNAME);
                Command::response(format!("{}: {}", nickname, text))
            }
            other => other,
        }
    }

    fn set_user_id(&mut self, fd: ConnId, user_id: String) {
        let (old_user, old_rooms) = match self.conns.get(&fd) {
            Some(conn) => (conn.user_id.clone(), conn.joined_rooms.clone()),
            None => return,
        };

        if !old_user.is_empty() {
            if let Some(sessions) = self.users.get_mut(&old_user) {
                sessions.remove(&fd);
                if sessions.is_empty() {
                    self.users.remove(&old_user);
                }
            }
        }

        for room_id in &old_rooms {
            if let Some(members) = self.rooms.get_mut(room_id) {
                members.remove(&fd);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }

        let conn = self.conns.get_mut(&fd).expect("connection checked above");
        conn.joined_rooms.clear();
        conn.user_id = user_id.clone();

        if !user_id.is_empty() {
            self.users.entry(user_id).or_default().insert(fd);
        }
    }

    fn set_joined_rooms(&mut self, fd: ConnId, room_ids: &[RoomId]) {
        let old_rooms = match self.conns.get(&fd) {
            Some(conn) => conn.joined_rooms.clone(),
            None => return,
        };

        for room_id in &old_rooms {
            if let Some(members) = self.rooms.get_mut(room_id) {
                members.remove(&fd);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }

        let conn = self.conns.get_mut(&fd).expect("connection checked above");
        conn.joined_rooms = room_ids.iter().copied().collect();

        for room_id in room_ids {
            self.rooms.entry(*room_id).or_default().insert(fd);
        }
    }

    fn send_friend_list(&mut self, fd: ConnId, friends: &[String]) {
        if !self.conns.contains_key(&fd) {
            return;
        }

        let mut out = String::new();
        out.push_str(&codec::encode(&Command::response(format!(
            "friends: {}",
            friends.len()
        ))));

        for friend in friends {
            let online = self
                .users
                .get(friend)
                .map(|sessions| !sessions.is_empty())
                .unwrap_or(false);
            let annotation = if online { "(online)" } else { "(offline)" };
            out.push_str(&codec::encode(&Command::response(format!(
                "{} {}",
                friend, annotation
            ))));
        }

        let _ = self.append_send(fd, out.as_bytes());
    }
}
