//! The node: settings, the listener and the wiring between the layers.
mod bootstrap;
mod network;
pub mod node;
mod router;
mod server;
pub mod settings;

pub use bootstrap::Bootstrapper;
pub use network::{RpcAnnouncer, RpcNodeQuery, RpcSyncTransport};
pub use node::{default_keypair_path, load_or_generate_identity, Node};
pub use router::*;
pub use server::*;
pub use settings::*;
