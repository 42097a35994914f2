//! Off-thread executors. Both pools share the same skeleton: a fixed set
//! of workers pulling from a mutex+condvar FIFO, draining what remains
//! after stop and rejecting later submissions.

pub mod db_pool;
pub mod pool;
