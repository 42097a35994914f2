//! Socket, buffer, TLS and wakeup plumbing shared by the server reactor
//! and the client worker.

pub mod addr;
pub mod buffer;
pub mod tls;
pub mod wakeup;
