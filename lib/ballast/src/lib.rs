#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod logging;
pub mod path;
pub mod stop;
