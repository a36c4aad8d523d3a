//! Requests and responses exchanged between nodes on top of the transport.
use crate::discovery::PeerInfo;
use crate::message::MessageType;
use crate::registry::ServiceInfo;
use crate::sync::{SyncRequest, SyncResponse};
use crate::zfx_id::Id;
use crate::Result;

use actix_derive::MessageResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // Registry
    Announce(ServiceInfo),
    // Discovery
    FindNodes { target: Id, sender: PeerInfo },
    // State
    Sync(SyncRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub enum Response {
    Ack,
    /// The responder's own description followed by the peers it knows closest to the target.
    Nodes(Vec<PeerInfo>),
    Sync(SyncResponse),
    // Error
    Unknown,
}

/// What actually travels in the payload of a DATA or SYNC message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    Request { id: u64, request: Request },
    /// A request that expects no response.
    Notify(Request),
    Response { id: u64, response: Response },
}

impl Envelope {
    /// State synchronization travels as SYNC, everything else as DATA.
    pub fn kind(&self) -> MessageType {
        match self {
            Envelope::Request { request: Request::Sync(_), .. }
            | Envelope::Notify(Request::Sync(_))
            | Envelope::Response { response: Response::Sync(_), .. } => MessageType::Sync,
            _ => MessageType::Data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Ok(bincode::deserialize(bytes)?)
    }
}
