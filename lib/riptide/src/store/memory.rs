use super::{ChatStore, InviteOutcome, LeaveOutcome, RoomInfo, RoomMessage};
use crate::RoomId;
use ballast::error::{DbError, Error, Result};
use hashbrown::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_NICKNAME: &str = "guest";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

struct UserRecord {
    pw: String,
    nickname: String,
}

struct RequestRecord {
    from: String,
    to: String,
    status: RequestStatus,
    seq: u64,
}

struct RoomRecord {
    name: String,
    owner: String,
    members: HashSet<String>,
    messages: Vec<RoomMessage>,
}

#[derive(Default)]
struct State {
    users: HashMap<String, UserRecord>,
    friendships: HashSet<(String, String)>,
    requests: Vec<RequestRecord>,
    rooms: HashMap<RoomId, RoomRecord>,
    next_room_id: RoomId,
    next_message_id: i64,
    next_seq: u64,
}

/// In-memory implementation of the store contract, guarded by a single
/// mutex the way the production service serializes its one connection.
pub struct MemoryStore {
    state: Mutex<State>,
}

fn friendship_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    secs.to_string()
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            state: Mutex::new(State {
                next_room_id: 1,
                next_message_id: 1,
                next_seq: 1,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Db(DbError::BrokenConnection))
    }
}

impl State {
    fn are_friends(&self, a: &str, b: &str) -> bool {
        self.friendships.contains(&friendship_key(a, b))
    }

    fn request_mut(&mut self, from: &str, to: &str) -> Option<&mut RequestRecord> {
        self.requests
            .iter_mut()
            .find(|req| req.from == from && req.to == to)
    }
}

impl ChatStore for MemoryStore {
    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn login(&self, id: &str, pw: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state
            .users
            .get(id)
            .filter(|user| user.pw == pw)
            .map(|user| user.nickname.clone()))
    }

    fn signup(&self, id: &str, pw: &str) -> Result<bool> {
        let mut state = self.lock()?;
        if state.users.contains_key(id) {
            return Ok(false);
        }

        state.users.insert(
            id.to_owned(),
            UserRecord {
                pw: pw.to_owned(),
                nickname: DEFAULT_NICKNAME.to_owned(),
            },
        );
        Ok(true)
    }

    fn change_nickname(&self, id: &str, nickname: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.users.get_mut(id) {
            Some(user) => {
                user.nickname = nickname.to_owned();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn request_friend(&self, from_user_id: &str, to_user_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        if !state.users.contains_key(from_user_id) || !state.users.contains_key(to_user_id) {
            return Err(Error::Db(DbError::ForeignKeyViolation));
        }

        if state.are_friends(from_user_id, to_user_id) {
            return Ok(false);
        }

        let seq = state.next_seq;
        match state.request_mut(from_user_id, to_user_id) {
            Some(existing) => match existing.status {
                RequestStatus::Pending | RequestStatus::Accepted => Ok(false),
                RequestStatus::Rejected => {
                    existing.status = RequestStatus::Pending;
                    existing.seq = seq;
                    state.next_seq += 1;
                    Ok(true)
                }
            },
            None => {
                state.requests.push(RequestRecord {
                    from: from_user_id.to_owned(),
                    to: to_user_id.to_owned(),
                    status: RequestStatus::Pending,
                    seq,
                });
                state.next_seq += 1;
                Ok(true)
            }
        }
    }

    fn accept_friend_request(&self, from_user_id: &str, to_user_id: &str) -> Result<bool> {
        let mut state = self.lock()?;

        match state.request_mut(from_user_id, to_user_id) {
            Some(req) if req.status == RequestStatus::Pending => {
                req.status = RequestStatus::Accepted;
            }
            _ => return Ok(false),
        }

        let key = friendship_key(from_user_id, to_user_id);
        state.friendships.insert(key);
        Ok(true)
    }

    fn reject_friend_request(&self, from_user_id: &str, to_user_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.request_mut(from_user_id, to_user_id) {
            Some(req) if req.status == RequestStatus::Pending => {
                req.status = RequestStatus::Rejected;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_friend(&self, user_id: &str, friend_user_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.friendships.remove(&friendship_key(user_id, friend_user_id)))
    }

    fn list_friends(&self, user_id: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut out: Vec<String> = state
            .friendships
            .iter()
            .filter_map(|(a, b)| {
                if a == user_id {
                    Some(b.clone())
                } else if b == user_id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn list_friend_requests(&self, to_user_id: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut pending: Vec<(u64, String)> = state
            .requests
            .iter()
            .filter(|req| req.to == to_user_id && req.status == RequestStatus::Pending)
            .map(|req| (req.seq, req.from.clone()))
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        Ok(pending.into_iter().map(|(_, from)| from).collect())
    }

    fn create_room(&self, owner_user_id: &str, name: &str) -> Result<RoomId> {
        let mut state = self.lock()?;
        if !state.users.contains_key(owner_user_id) {
            return Err(Error::Db(DbError::ForeignKeyViolation));
        }

        let id = state.next_room_id;
        state.next_room_id += 1;

        let mut members = HashSet::new();
        members.insert(owner_user_id.to_owned());

        state.rooms.insert(
            id,
            RoomRecord {
                name: name.to_owned(),
                owner: owner_user_id.to_owned(),
                members,
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    fn delete_room(&self, owner_user_id: &str, room_id: RoomId) -> Result<bool> {
        let mut state = self.lock()?;
        match state.rooms.get(&room_id) {
            Some(room) if room.owner == owner_user_id => {
                state.rooms.remove(&room_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn invite_room(
        &self,
        inviter_user_id: &str,
        room_id: RoomId,
        invitee_user_id: &str,
    ) -> Result<InviteOutcome> {
        let mut state = self.lock()?;

        let inviter_is_member = match state.rooms.get(&room_id) {
            Some(room) => room.members.contains(inviter_user_id),
            None => false,
        };
        if !inviter_is_member {
            return Ok(InviteOutcome::RoomNotFoundOrNoPermission);
        }

        if !state.are_friends(inviter_user_id, invitee_user_id) {
            return Ok(InviteOutcome::NotFriend);
        }

        let room = state
            .rooms
            .get_mut(&room_id)
            .expect("room vanished under the store lock");
        if !room.members.insert(invitee_user_id.to_owned()) {
            return Ok(InviteOutcome::AlreadyMember);
        }
        Ok(InviteOutcome::Invited)
    }

    fn leave_room(&self, user_id: &str, room_id: RoomId) -> Result<LeaveOutcome> {
        let mut state = self.lock()?;
        let room = match state.rooms.get_mut(&room_id) {
            Some(room) => room,
            None => return Ok(LeaveOutcome::NotMemberOrRoomNotFound),
        };

        if !room.members.contains(user_id) {
            return Ok(LeaveOutcome::NotMemberOrRoomNotFound);
        }
        if room.owner == user_id {
            return Ok(LeaveOutcome::OwnerCannotLeave);
        }

        room.members.remove(user_id);
        Ok(LeaveOutcome::Left)
    }

    fn list_rooms(&self, user_id: &str) -> Result<Vec<RoomInfo>> {
        let state = self.lock()?;
        let mut rooms: Vec<RoomInfo> = state
            .rooms
            .iter()
            .filter(|(_, room)| room.members.contains(user_id))
            .map(|(id, room)| RoomInfo {
                id: *id,
                name: room.name.clone(),
                owner_user_id: room.owner.clone(),
                member_count: room.members.len(),
            })
            .collect();
        rooms.sort_by_key(|room| room.id);
        Ok(rooms)
    }

    fn create_room_message(
        &self,
        room_id: RoomId,
        sender_user_id: &str,
        body: &str,
    ) -> Result<Option<i64>> {
        let mut state = self.lock()?;
        let id = state.next_message_id;

        let room = match state.rooms.get_mut(&room_id) {
            Some(room) if room.members.contains(sender_user_id) => room,
            _ => return Ok(None),
        };

        room.messages.push(RoomMessage {
            id,
            created_at: timestamp(),
            sender_user_id: sender_user_id.to_owned(),
            body: body.to_owned(),
        });
        state.next_message_id += 1;
        Ok(Some(id))
    }

    fn list_room_messages(
        &self,
        user_id: &str,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Option<Vec<RoomMessage>>> {
        let state = self.lock()?;
        let room = match state.rooms.get(&room_id) {
            Some(room) if room.members.contains(user_id) => room,
            _ => return Ok(None),
        };

        let newest_first: Vec<RoomMessage> =
            room.messages.iter().rev().take(limit).cloned().collect();
        Ok(Some(newest_first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users(users: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for user in users {
            assert!(store.signup(user, "pw").unwrap());
        }
        store
    }

    #[test]
    fn test_signup_and_login() {
        let store = MemoryStore::new();

        assert!(store.signup("alice", "pw").unwrap());
        assert!(!store.signup("alice", "other").unwrap());

        assert_eq!(store.login("alice", "pw").unwrap(), Some("guest".to_owned()));
        assert_eq!(store.login("alice", "wrong").unwrap(), None);
        assert_eq!(store.login("nobody", "pw").unwrap(), None);
    }

    #[test]
    fn test_change_nickname_requires_user() {
        let store = store_with_users(&["alice"]);

        assert!(store.change_nickname("alice", "ada").unwrap());
        assert_eq!(store.login("alice", "pw").unwrap(), Some("ada".to_owned()));
        assert!(!store.change_nickname("nobody", "x").unwrap());
    }

    #[test]
    fn test_friend_request_lifecycle() {
        let store = store_with_users(&["alice", "bob"]);

        assert!(store.request_friend("alice", "bob").unwrap());
        // Duplicate while pending.
        assert!(!store.request_friend("alice", "bob").unwrap());
        assert_eq!(store.list_friend_requests("bob").unwrap(), vec!["alice"]);

        assert!(store.accept_friend_request("alice", "bob").unwrap());
        assert!(store.list_friend_requests("bob").unwrap().is_empty());
        assert_eq!(store.list_friends("alice").unwrap(), vec!["bob"]);
        assert_eq!(store.list_friends("bob").unwrap(), vec!["alice"]);

        // Already friends now.
        assert!(!store.request_friend("bob", "alice").unwrap());
    }

    #[test]
    fn test_rejected_request_can_be_resent() {
        let store = store_with_users(&["alice", "bob"]);

        assert!(store.request_friend("alice", "bob").unwrap());
        assert!(store.reject_friend_request("alice", "bob").unwrap());
        assert!(store.list_friend_requests("bob").unwrap().is_empty());

        assert!(store.request_friend("alice", "bob").unwrap());
        assert_eq!(store.list_friend_requests("bob").unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_request_to_unknown_user_is_a_constraint_error() {
        let store = store_with_users(&["alice"]);
        let err = store.request_friend("alice", "ghost").unwrap_err();
        assert_eq!(err, Error::Db(DbError::ForeignKeyViolation));
    }

    #[test]
    fn test_remove_friend() {
        let store = store_with_users(&["alice", "bob"]);
        store.request_friend("alice", "bob").unwrap();
        store.accept_friend_request("alice", "bob").unwrap();

        assert!(store.remove_friend("bob", "alice").unwrap());
        assert!(!store.remove_friend("bob", "alice").unwrap());
        assert!(store.list_friends("alice").unwrap().is_empty());
    }

    #[test]
    fn test_create_room_auto_joins_owner() {
        let store = store_with_users(&["alice"]);
        let id = store.create_room("alice", "lobby").unwrap();
        assert_eq!(id, 1);

        let rooms = store.list_rooms("alice").unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "lobby");
        assert_eq!(rooms[0].owner_user_id, "alice");
        assert_eq!(rooms[0].member_count, 1);
    }

    #[test]
    fn test_delete_room_is_owner_only() {
        let store = store_with_users(&["alice", "bob"]);
        let id = store.create_room("alice", "lobby").unwrap();

        assert!(!store.delete_room("bob", id).unwrap());
        assert!(store.delete_room("alice", id).unwrap());
        assert!(!store.delete_room("alice", id).unwrap());
    }

    #[test]
    fn test_invite_room_outcomes() {
        let store = store_with_users(&["alice", "bob", "carol"]);
        let id = store.create_room("alice", "lobby").unwrap();

        // Inviter not a member / missing room.
        assert_eq!(
            store.invite_room("bob", id, "carol").unwrap(),
            InviteOutcome::RoomNotFoundOrNoPermission
        );
        assert_eq!(
            store.invite_room("alice", 999, "bob").unwrap(),
            InviteOutcome::RoomNotFoundOrNoPermission
        );

        // Not friends yet.
        assert_eq!(
            store.invite_room("alice", id, "bob").unwrap(),
            InviteOutcome::NotFriend
        );

        store.request_friend("alice", "bob").unwrap();
        store.accept_friend_request("alice", "bob").unwrap();

        assert_eq!(
            store.invite_room("alice", id, "bob").unwrap(),
            InviteOutcome::Invited
        );
        assert_eq!(
            store.invite_room("alice", id, "bob").unwrap(),
            InviteOutcome::AlreadyMember
        );

        let rooms = store.list_rooms("bob").unwrap();
        assert_eq!(rooms[0].member_count, 2);
    }

    #[test]
    fn test_leave_room_outcomes() {
        let store = store_with_users(&["alice", "bob"]);
        let id = store.create_room("alice", "lobby").unwrap();
        store.request_friend("alice", "bob").unwrap();
        store.accept_friend_request("alice", "bob").unwrap();
        store.invite_room("alice", id, "bob").unwrap();

        assert_eq!(store.leave_room("alice", id).unwrap(), LeaveOutcome::OwnerCannotLeave);
        assert_eq!(store.leave_room("bob", id).unwrap(), LeaveOutcome::Left);
        assert_eq!(
            store.leave_room("bob", id).unwrap(),
            LeaveOutcome::NotMemberOrRoomNotFound
        );
        assert_eq!(
            store.leave_room("bob", 999).unwrap(),
            LeaveOutcome::NotMemberOrRoomNotFound
        );
    }

    #[test]
    fn test_messages_are_membership_gated() {
        let store = store_with_users(&["alice", "bob"]);
        let id = store.create_room("alice", "lobby").unwrap();

        assert_eq!(store.create_room_message(id, "bob", "hi").unwrap(), None);
        assert_eq!(store.create_room_message(999, "alice", "hi").unwrap(), None);

        let first = store.create_room_message(id, "alice", "one").unwrap().unwrap();
        let second = store.create_room_message(id, "alice", "two").unwrap().unwrap();
        assert!(second > first);

        assert_eq!(store.list_room_messages("bob", id, 10).unwrap(), None);

        let history = store.list_room_messages("alice", id, 10).unwrap().unwrap();
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].body, "two");
        assert_eq!(history[1].body, "one");

        let limited = store.list_room_messages("alice", id, 1).unwrap().unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].body, "two");
    }
}
