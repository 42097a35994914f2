//! The networking core: reactor, connection registry, TLS plumbing, wire
//! codec, and the off-thread executors that together form the chat server.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Raw descriptor identifier used as the registry key. Only ever used for
/// lookup; the owning `Connection` closes the descriptor on drop.
pub type ConnId = std::os::unix::io::RawFd;

/// Room identifier as issued by the store.
pub type RoomId = i64;

pub mod client;
pub mod exec;
pub mod net;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod store;
