//! archipeld — the Archipel peer daemon as a library.
//!
//! `Node::start` brings up discovery, the connection manager and the
//! transfer engine around one set of shared tables. The binary in `main.rs`
//! and the integration tests both drive nodes through it.

pub mod connection;
pub mod context;
pub mod discovery;
pub mod framing;
pub mod node;
pub mod transfer;

pub use connection::{ConnectionManager, HandshakeError, SessionHandle, SessionTable};
pub use context::NodeContext;
pub use node::{command_channel, Command, Node, NodeStatus};
pub use transfer::{TransferEngine, TransferHandle, TransferStatus};
