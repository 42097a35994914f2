//! The text wire protocol: `\n`-terminated lines whose fields are
//! separated by a bare `\r` record-separator byte.

pub mod codec;
