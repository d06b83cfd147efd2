//! Control-stream state machine and per-connection orchestration
//! (spec.md §4.5, §5).
pub mod connection;
pub mod control;

pub use connection::Connection;
