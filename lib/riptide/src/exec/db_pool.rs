use crate::protocol::codec::Command;
use crate::reactor::conn::DEFAULT_NICKNAME;
use crate::reactor::registry::RegistryHandle;
use crate::store::{ChatStore, InviteOutcome, LeaveOutcome};
use crate::{ConnId, RoomId};
use ballast::error::Result;
use ballast::logging::{self, Logger};
use ballast::stop::StopToken;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// One database task. `user_id` is the submitter's login snapshot taken
/// at enqueue time on the reactor thread.
pub struct DbTask {
    pub cmd: Command,
    pub fd: ConnId,
    pub user_id: String,
}

struct DbInner {
    run: bool,
    tasks: VecDeque<DbTask>,
}

struct DbShared {
    inner: Mutex<DbInner>,
    available: Condvar,
}

/// Serializes database work off the reactor thread. Structurally the
/// general pool with a store reference attached; the store itself guards
/// its single connection.
pub struct DbExecutor {
    shared: Arc<DbShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DbExecutor {
    pub fn new(
        size: usize,
        store: Arc<dyn ChatStore>,
        registry: Arc<RegistryHandle>,
        stop: StopToken,
        log: &Logger,
    ) -> DbExecutor {
        let size = size.max(1);
        let shared = Arc::new(DbShared {
            inner: Mutex::new(DbInner {
                run: true,
                tasks: VecDeque::new(),
            }),
            available: Condvar::new(),
        });

        {
            let shared = shared.clone();
            stop.on_stop(move || shared.available.notify_all());
        }

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = shared.clone();
            let store = store.clone();
            let registry = registry.clone();
            let stop = stop.clone();
            let log = log.new(logging::o!("component" => "db-executor", "worker" => index));
            workers.push(std::thread::spawn(move || {
                worker_loop(&shared, store.as_ref(), &registry, &stop, &log)
            }));
        }

        DbExecutor {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// True for every command that requires a query.
    pub fn is_db_command(cmd: &Command) -> bool {
        match cmd {
            Command::Login { .. }
            | Command::Register { .. }
            | Command::Say { .. }
            | Command::Nick { .. }
            | Command::FriendRequest { .. }
            | Command::FriendAccept { .. }
            | Command::FriendReject { .. }
            | Command::FriendRemove { .. }
            | Command::ListFriend
            | Command::ListFriendRequest
            | Command::CreateRoom { .. }
            | Command::DeleteRoom { .. }
            | Command::InviteRoom { .. }
            | Command::LeaveRoom { .. }
            | Command::ListRoom
            | Command::History { .. } => true,
            Command::Response { .. } => false,
        }
    }

    pub fn enqueue(&self, cmd: Command, fd: ConnId, user_id: String) -> bool {
        if !Self::is_db_command(&cmd) {
            return false;
        }

        {
            let mut inner = self.shared.inner.lock().expect("db pool lock poisoned");
            if !inner.run {
                return false;
            }
            inner.tasks.push_back(DbTask { cmd, fd, user_id });
        }
        self.shared.available.notify_one();
        true
    }

    pub fn stop(&self) {
        {
            let mut inner = self.shared.inner.lock().expect("db pool lock poisoned");
            inner.run = false;
        }
        self.shared.available.notify_all();

        let mut workers = self.workers.lock().expect("db pool worker list poisoned");
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DbExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    shared: &DbShared,
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    stop: &StopToken,
    log: &Logger,
) {
    loop {
        let task = {
            let mut inner = shared.inner.lock().expect("db pool lock poisoned");
            loop {
                if let Some(task) = inner.tasks.pop_front() {
                    break task;
                }
                if !inner.run || stop.is_stop_requested() {
                    return;
                }
                inner = shared.available.wait(inner).expect("db pool lock poisoned");
            }
        };

        execute(store, registry, log, task);
    }
}

fn load_joined_room_ids(store: &dyn ChatStore, user_id: &str) -> Result<Vec<RoomId>> {
    let rooms = store.list_rooms(user_id)?;
    Ok(rooms.iter().map(|room| room.id).collect())
}

/// Strict positive integer; anything else is a user error.
fn parse_room_id(text: &str) -> Option<RoomId> {
    text.parse::<RoomId>().ok().filter(|id| *id > 0)
}

fn parse_limit(text: &str) -> Option<usize> {
    text.parse::<i64>()
        .ok()
        .filter(|limit| (1..=100).contains(limit))
        .map(|limit| limit as usize)
}

/// True when the task may proceed; otherwise the login guard reply has
/// been sent.
fn require_login(registry: &RegistryHandle, fd: ConnId, user_id: &str) -> bool {
    if user_id.is_empty() {
        registry.request_send(fd, Command::response("login first"));
        return false;
    }
    true
}

fn reset_session(registry: &RegistryHandle, fd: ConnId) {
    registry.request_set_user_id(fd, String::new());
    registry.request_set_joined_rooms(fd, Vec::new());
    registry.request_change_nickname(fd, DEFAULT_NICKNAME.to_owned());
}

fn execute(store: &dyn ChatStore, registry: &RegistryHandle, log: &Logger, task: DbTask) {
    let DbTask { cmd, fd, user_id } = task;

    match cmd {
        Command::Login { id, pw } => login(store, registry, log, fd, &id, &pw),
        Command::Register { id, pw } => register(store, registry, log, fd, &id, &pw),
        Command::Say { room_id, text } => say(store, registry, log, fd, &user_id, &room_id, &text),
        Command::Nick { nick } => nick_change(store, registry, log, fd, &user_id, &nick),
        Command::FriendRequest { to_user_id } => {
            friend_request(store, registry, log, fd, &user_id, &to_user_id)
        }
        Command::FriendAccept { from_user_id } => {
            friend_accept(store, registry, log, fd, &user_id, &from_user_id)
        }
        Command::FriendReject { from_user_id } => {
            friend_reject(store, registry, log, fd, &user_id, &from_user_id)
        }
        Command::FriendRemove { friend_user_id } => {
            friend_remove(store, registry, log, fd, &user_id, &friend_user_id)
        }
        Command::ListFriend => list_friend(store, registry, log, fd, &user_id),
        Command::ListFriendRequest => list_friend_request(store, registry, log, fd, &user_id),
        Command::CreateRoom { room_name } => {
            create_room(store, registry, log, fd, &user_id, &room_name)
        }
        Command::DeleteRoom { room_id } => delete_room(store, registry, log, fd, &user_id, &room_id),
        Command::InviteRoom {
            room_id,
            friend_user_id,
        } => invite_room(store, registry, log, fd, &user_id, &room_id, &friend_user_id),
        Command::LeaveRoom { room_id } => leave_room(store, registry, log, fd, &user_id, &room_id),
        Command::ListRoom => list_room(store, registry, log, fd, &user_id),
        Command::History { room_id, limit } => {
            history(store, registry, log, fd, &user_id, &room_id, &limit)
        }
        Command::Response { .. } => {}
    }
}

fn login(store: &dyn ChatStore, registry: &RegistryHandle, log: &Logger, fd: ConnId, id: &str, pw: &str) {
    let outcome = match store.login(id, pw) {
        Ok(outcome) => outcome,
        Err(err) => {
            logging::error!(log, "login failed"; "error" => %err);
            registry.request_send(fd, Command::response("login failed"));
            reset_session(registry, fd);
            return;
        }
    };

    match outcome {
        Some(nickname) => {
            let joined_room_ids = match load_joined_room_ids(store, id) {
                Ok(ids) => ids,
                Err(err) => {
                    logging::error!(log, "load joined rooms failed"; "error" => %err);
                    registry.request_send(fd, Command::response("login failed"));
                    reset_session(registry, fd);
                    return;
                }
            };

            registry.request_set_user_id(fd, id.to_owned());
            registry.request_set_joined_rooms(fd, joined_room_ids);
            registry.request_change_nickname(fd, nickname);
            registry.request_send(fd, Command::response("login success"));
        }
        None => {
            reset_session(registry, fd);
            registry.request_send(fd, Command::response("login failed"));
        }
    }
}

fn register(store: &dyn ChatStore, registry: &RegistryHandle, log: &Logger, fd: ConnId, id: &str, pw: &str) {
    match store.signup(id, pw) {
        Ok(true) => registry.request_send(fd, Command::response("register success")),
        Ok(false) => registry.request_send(fd, Command::response("id already exists")),
        Err(err) => {
            logging::error!(log, "register failed"; "error" => %err);
            registry.request_send(fd, Command::response("register failed"));
        }
    }
}

fn say(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_id: &str,
    text: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    let room_id = match parse_room_id(room_id) {
        Some(room_id) => room_id,
        None => {
            registry.request_send(fd, Command::response("invalid room id"));
            return;
        }
    };

    match store.create_room_message(room_id, user_id, text) {
        Ok(Some(_)) => {
            registry.request_room_broadcast(fd, room_id, Command::response(text));
        }
        Ok(None) => {
            registry.request_send(fd, Command::response("room not found or no permission"));
        }
        Err(err) => {
            logging::error!(log, "create room message failed"; "error" => %err);
            registry.request_send(fd, Command::response("send failed"));
        }
    }
}

fn nick_change(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    nick: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.change_nickname(user_id, nick) {
        Ok(true) => {
            registry.request_change_nickname(fd, nick.to_owned());
            registry.request_send(fd, Command::response("nick change success"));
        }
        Ok(false) => registry.request_send(fd, Command::response("nick change failed")),
        Err(err) => {
            logging::error!(log, "change nickname failed"; "error" => %err);
            registry.request_send(fd, Command::response("nick change failed"));
        }
    }
}

fn friend_request(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    to_user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }
    if user_id == to_user_id {
        registry.request_send(fd, Command::response("cannot request yourself"));
        return;
    }

    match store.request_friend(user_id, to_user_id) {
        Ok(true) => {
            registry.request_send(fd, Command::response("friend request sent"));
            logging::info!(log, "friend request sent"; "from" => user_id, "to" => to_user_id);
        }
        Ok(false) => registry.request_send(
            fd,
            Command::response("friend request already exists or already friends"),
        ),
        Err(err) => {
            logging::error!(log, "friend request failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend request failed"));
        }
    }
}

fn friend_accept(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    from_user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.accept_friend_request(from_user_id, user_id) {
        Ok(true) => {
            registry.request_send(fd, Command::response("friend request accepted"));
            logging::info!(log, "friend request accepted"; "from" => from_user_id, "by" => user_id);
        }
        Ok(false) => registry.request_send(fd, Command::response("no pending friend request")),
        Err(err) => {
            logging::error!(log, "friend request accept failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend request accept failed"));
        }
    }
}

fn friend_reject(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    from_user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.reject_friend_request(from_user_id, user_id) {
        Ok(true) => {
            registry.request_send(fd, Command::response("friend request rejected"));
            logging::info!(log, "friend request rejected"; "from" => from_user_id, "by" => user_id);
        }
        Ok(false) => registry.request_send(fd, Command::response("no pending friend request")),
        Err(err) => {
            logging::error!(log, "friend request reject failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend request reject failed"));
        }
    }
}

fn friend_remove(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    friend_user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }
    if user_id == friend_user_id {
        registry.request_send(fd, Command::response("cannot remove yourself"));
        return;
    }

    match store.remove_friend(user_id, friend_user_id) {
        Ok(true) => {
            registry.request_send(fd, Command::response("friend removed"));
            logging::info!(log, "friend removed"; "user" => user_id, "friend" => friend_user_id);
        }
        Ok(false) => registry.request_send(fd, Command::response("friend not found")),
        Err(err) => {
            logging::error!(log, "friend remove failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend remove failed"));
        }
    }
}

fn list_friend(store: &dyn ChatStore, registry: &RegistryHandle, log: &Logger, fd: ConnId, user_id: &str) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.list_friends(user_id) {
        Ok(friends) => {
            if friends.is_empty() {
                registry.request_send(fd, Command::response("no friends"));
                return;
            }
            registry.request_send_friend_list(fd, friends);
        }
        Err(err) => {
            logging::error!(log, "friend list failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend list failed"));
        }
    }
}

fn list_friend_request(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.list_friend_requests(user_id) {
        Ok(senders) => {
            if senders.is_empty() {
                registry.request_send(fd, Command::response("no pending friend requests"));
                return;
            }

            registry.request_send(
                fd,
                Command::response(format!("pending friend requests: {}", senders.len())),
            );
            for from_user_id in senders {
                registry.request_send(fd, Command::response(format!("from: {}", from_user_id)));
            }
        }
        Err(err) => {
            logging::error!(log, "friend requests list failed"; "error" => %err);
            registry.request_send(fd, Command::response("friend requests list failed"));
        }
    }
}

fn create_room(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_name: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }
    if room_name.is_empty() {
        registry.request_send(fd, Command::response("room name is empty"));
        return;
    }

    let room_id = match store.create_room(user_id, room_name) {
        Ok(room_id) => room_id,
        Err(err) => {
            logging::error!(log, "create room failed"; "error" => %err);
            registry.request_send(fd, Command::response("create room failed"));
            return;
        }
    };

    registry.request_send(
        fd,
        Command::response(format!("room created: {} ({})", room_id, room_name)),
    );

    match load_joined_room_ids(store, user_id) {
        Ok(joined_room_ids) => registry.request_set_joined_rooms(fd, joined_room_ids),
        Err(err) => {
            logging::warn!(log, "refresh joined rooms index failed"; "error" => %err);
        }
    }
    logging::info!(log, "room created"; "user" => user_id, "room" => room_id);
}

fn delete_room(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    let room_id = match parse_room_id(room_id) {
        Some(room_id) => room_id,
        None => {
            registry.request_send(fd, Command::response("invalid room id"));
            return;
        }
    };

    match store.delete_room(user_id, room_id) {
        Ok(true) => {
            match load_joined_room_ids(store, user_id) {
                Ok(joined_room_ids) => registry.request_set_joined_rooms(fd, joined_room_ids),
                Err(err) => {
                    logging::warn!(log, "refresh joined rooms index failed"; "error" => %err);
                }
            }
            registry.request_send(fd, Command::response(format!("room deleted: {}", room_id)));
            logging::info!(log, "room deleted"; "user" => user_id, "room" => room_id);
        }
        Ok(false) => {
            registry.request_send(fd, Command::response("room not found or no permission"));
        }
        Err(err) => {
            logging::error!(log, "delete room failed"; "error" => %err);
            registry.request_send(fd, Command::response("delete room failed"));
        }
    }
}

fn invite_room(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_id: &str,
    friend_user_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }
    if user_id == friend_user_id {
        registry.request_send(fd, Command::response("cannot invite yourself"));
        return;
    }

    let room_id = match parse_room_id(room_id) {
        Some(room_id) => room_id,
        None => {
            registry.request_send(fd, Command::response("invalid room id"));
            return;
        }
    };

    let outcome = match store.invite_room(user_id, room_id, friend_user_id) {
        Ok(outcome) => outcome,
        Err(err) => {
            logging::error!(log, "invite room failed"; "error" => %err);
            registry.request_send(fd, Command::response("invite room failed"));
            return;
        }
    };

    match outcome {
        InviteOutcome::Invited => {
            // Both parties' joined-room lists are refreshed on every
            // concurrent session.
            match load_joined_room_ids(store, user_id) {
                Ok(ids) => registry.request_set_joined_rooms_for_user(user_id.to_owned(), ids),
                Err(err) => {
                    logging::warn!(log, "refresh inviter joined rooms index failed"; "error" => %err);
                }
            }
            match load_joined_room_ids(store, friend_user_id) {
                Ok(ids) => registry.request_set_joined_rooms_for_user(friend_user_id.to_owned(), ids),
                Err(err) => {
                    logging::warn!(log, "refresh invitee joined rooms index failed"; "error" => %err);
                }
            }

            registry.request_send(
                fd,
                Command::response(format!(
                    "room invite sent: room={} user={}",
                    room_id, friend_user_id
                )),
            );
            logging::info!(log, "room invite";
                           "inviter" => user_id, "invitee" => friend_user_id, "room" => room_id);
        }
        InviteOutcome::AlreadyMember => {
            registry.request_send(fd, Command::response("user already in room"));
        }
        InviteOutcome::NotFriend => {
            registry.request_send(fd, Command::response("can invite friends only"));
        }
        InviteOutcome::RoomNotFoundOrNoPermission => {
            registry.request_send(fd, Command::response("room not found or no permission"));
        }
    }
}

fn leave_room(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_id: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    let room_id = match parse_room_id(room_id) {
        Some(room_id) => room_id,
        None => {
            registry.request_send(fd, Command::response("invalid room id"));
            return;
        }
    };

    let outcome = match store.leave_room(user_id, room_id) {
        Ok(outcome) => outcome,
        Err(err) => {
            logging::error!(log, "leave room failed"; "error" => %err);
            registry.request_send(fd, Command::response("leave room failed"));
            return;
        }
    };

    match outcome {
        LeaveOutcome::Left => {
            match load_joined_room_ids(store, user_id) {
                Ok(ids) => registry.request_set_joined_rooms_for_user(user_id.to_owned(), ids),
                Err(err) => {
                    logging::warn!(log, "refresh joined rooms index failed"; "error" => %err);
                }
            }
            registry.request_send(fd, Command::response(format!("left room: {}", room_id)));
            logging::info!(log, "left room"; "user" => user_id, "room" => room_id);
        }
        LeaveOutcome::NotMemberOrRoomNotFound => {
            registry.request_send(fd, Command::response("room not found or not joined"));
        }
        LeaveOutcome::OwnerCannotLeave => {
            registry.request_send(
                fd,
                Command::response("room owner cannot leave (delete room instead)"),
            );
        }
    }
}

fn list_room(store: &dyn ChatStore, registry: &RegistryHandle, log: &Logger, fd: ConnId, user_id: &str) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    match store.list_rooms(user_id) {
        Ok(rooms) => {
            if rooms.is_empty() {
                registry.request_send(fd, Command::response("no rooms"));
                return;
            }

            registry.request_send(fd, Command::response(format!("rooms: {}", rooms.len())));
            for room in rooms {
                registry.request_send(
                    fd,
                    Command::response(format!(
                        "room: id={} name={} owner={} members={}",
                        room.id, room.name, room.owner_user_id, room.member_count
                    )),
                );
            }
        }
        Err(err) => {
            logging::error!(log, "list room failed"; "error" => %err);
            registry.request_send(fd, Command::response("list room failed"));
        }
    }
}

fn history(
    store: &dyn ChatStore,
    registry: &RegistryHandle,
    log: &Logger,
    fd: ConnId,
    user_id: &str,
    room_id: &str,
    limit: &str,
) {
    if !require_login(registry, fd, user_id) {
        return;
    }

    let room_id = match parse_room_id(room_id) {
        Some(room_id) => room_id,
        None => {
            registry.request_send(fd, Command::response("invalid room id"));
            return;
        }
    };

    let limit = match parse_limit(limit) {
        Some(limit) => limit,
        None => {
            registry.request_send(fd, Command::response("invalid limit (1-100)"));
            return;
        }
    };

    let messages = match store.list_room_messages(user_id, room_id, limit) {
        Ok(Some(messages)) => messages,
        Ok(None) => {
            registry.request_send(fd, Command::response("room not found or no permission"));
            return;
        }
        Err(err) => {
            logging::error!(log, "history query failed"; "error" => %err);
            registry.request_send(fd, Command::response("history query failed"));
            return;
        }
    };

    registry.request_send(
        fd,
        Command::response(format!("history: room={} count={}", room_id, messages.len())),
    );
    for msg in messages {
        registry.request_send(
            fd,
            Command::response(format!(
                "history: id={} at={} from={} text={}",
                msg.id, msg.created_at, msg.sender_user_id, msg.body
            )),
        );
    }
}
