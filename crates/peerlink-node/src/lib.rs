//! PeerLink node
//!
//! A serverless LAN peer: it answers discovery probes, dispatches control
//! messages, moves files in length-prefixed chunks and keeps group
//! membership converged across peers.

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod groups;
pub mod node;
pub mod server;
pub mod state;
pub mod transfer;

pub use config::Config;
pub use events::{EventReceiver, NodeEvent};
pub use node::Node;
pub use state::ChatEntry;
pub use transfer::InboundRequest;
