//! The database contract. The executors speak to the store exclusively
//! through [`ChatStore`]; each operation is atomic from the caller's point
//! of view. A SQL-backed implementation is an external collaborator;
//! [`MemoryStore`] is the bundled reference implementation.

mod memory;

pub use self::memory::MemoryStore;

use crate::RoomId;
use ballast::error::Result;

/// Outcome of a room invitation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    Invited,
    AlreadyMember,
    NotFriend,
    RoomNotFoundOrNoPermission,
}

/// Outcome of leaving a room.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    NotMemberOrRoomNotFound,
    OwnerCannotLeave,
}

/// One room as the caller is allowed to see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub owner_user_id: String,
    pub member_count: usize,
}

/// One persisted room message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub id: i64,
    pub created_at: String,
    pub sender_user_id: String,
    pub body: String,
}

pub trait ChatStore: Send + Sync {
    /// Liveness probe, run once at startup.
    fn ping(&self) -> Result<()>;

    /// Checks credentials; `Some(nickname)` on success.
    fn login(&self, id: &str, pw: &str) -> Result<Option<String>>;

    /// Creates an account with the default nickname. False when the id is
    /// already taken.
    fn signup(&self, id: &str, pw: &str) -> Result<bool>;

    /// False when the user does not exist.
    fn change_nickname(&self, id: &str, nickname: &str) -> Result<bool>;

    /// False when a request is already pending or the users are already
    /// friends; a previously rejected request may be re-sent.
    fn request_friend(&self, from_user_id: &str, to_user_id: &str) -> Result<bool>;

    /// False when no pending request exists.
    fn accept_friend_request(&self, from_user_id: &str, to_user_id: &str) -> Result<bool>;

    /// False when no pending request exists.
    fn reject_friend_request(&self, from_user_id: &str, to_user_id: &str) -> Result<bool>;

    /// False when the users are not friends.
    fn remove_friend(&self, user_id: &str, friend_user_id: &str) -> Result<bool>;

    /// Friend ids in ascending order.
    fn list_friends(&self, user_id: &str) -> Result<Vec<String>>;

    /// Pending senders in request order.
    fn list_friend_requests(&self, to_user_id: &str) -> Result<Vec<String>>;

    /// Creates a room owned by (and containing) `owner_user_id`; returns
    /// the new room id.
    fn create_room(&self, owner_user_id: &str, name: &str) -> Result<RoomId>;

    /// Owner-only. False when the room is missing or not owned by the
    /// caller.
    fn delete_room(&self, owner_user_id: &str, room_id: RoomId) -> Result<bool>;

    fn invite_room(
        &self,
        inviter_user_id: &str,
        room_id: RoomId,
        invitee_user_id: &str,
    ) -> Result<InviteOutcome>;

    fn leave_room(&self, user_id: &str, room_id: RoomId) -> Result<LeaveOutcome>;

    /// Rooms the user is a member of, ascending by id.
    fn list_rooms(&self, user_id: &str) -> Result<Vec<RoomInfo>>;

    /// Persists a message; `Some(message id)` only when the sender is a
    /// member of the room.
    fn create_room_message(
        &self,
        room_id: RoomId,
        sender_user_id: &str,
        body: &str,
    ) -> Result<Option<i64>>;

    /// Latest `limit` messages, newest first; `None` when the caller is
    /// not a member.
    fn list_room_messages(
        &self,
        user_id: &str,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Option<Vec<RoomMessage>>>;
}
