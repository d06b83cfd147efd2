//! Core of a real-time media relay over QUIC: the fragment cache, publisher
//! cursor, datagram ack tracker, and the control/datagram wire protocol that
//! ties them to a connection. `quicr-relay` is the thin binary on top.
pub mod ack;
pub mod cache;
pub mod coding;
pub mod datagram;
pub mod error;
pub mod fragment;
pub mod message;
pub mod node;
pub mod publisher;
pub mod quic;
pub mod reassembly;
pub mod relay;
pub mod session;
pub mod util;

pub use cache::Cache;
pub use error::{Error, Result};
pub use fragment::Fragment;
pub use node::Node;
