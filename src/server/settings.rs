use crate::connection::ConnectionSettings;
use crate::crypto::{MemoryKeyStore, RateLimitSettings};
use crate::discovery::DiscoverySettings;
use crate::registry::RegistrySettings;
use crate::sync::SyncSettings;
use crate::transport::TransportSettings;
use crate::zfx_id::Id;
use crate::{Error, Result};

use config::{Config, Environment, File};

use std::convert::TryInto;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `ZFX_MESH_TRANSPORT__CHUNK_SIZE=32768`.
pub const ENV_PREFIX: &str = "ZFX_MESH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listener_ip: String,
    /// Peers to connect to on start, as `IP` or `ID@IP`.
    pub bootstrap_peers: Vec<String>,
    /// Hex encoded ed25519 keypair.
    pub keypair: Option<String>,
    /// Symmetric keys for encrypted traffic, as `ID:KEY` with a hex encoded 32 byte key.
    pub shared_keys: Vec<String>,
    pub region: Option<String>,
    pub capacity: u64,
    /// Names of the services this node offers, used by discovery filters.
    pub services: Vec<String>,
    pub rpc_timeout_ms: u64,
    pub bootstrap_delta_ms: u64,
    pub transport: TransportSettings,
    pub connection: ConnectionSettings,
    pub registry: RegistrySettings,
    pub discovery: DiscoverySettings,
    pub rate_limit: RateLimitSettings,
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listener_ip: "127.0.0.1:1234".to_string(),
            bootstrap_peers: vec![],
            keypair: None,
            shared_keys: vec![],
            region: None,
            capacity: 0,
            services: vec![],
            rpc_timeout_ms: 5_000,
            bootstrap_delta_ms: 1_000,
            transport: TransportSettings::default(),
            connection: ConnectionSettings::default(),
            registry: RegistrySettings::default(),
            discovery: DiscoverySettings::default(),
            rate_limit: RateLimitSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by `file` when given, overridden by the environment.
    pub fn new(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("bootstrap_peers")
            .with_list_parse_key("services")
            .with_list_parse_key("shared_keys");
        let settings = builder.add_source(environment).build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn listener_address(&self) -> Result<SocketAddr> {
        self.listener_ip.parse().map_err(|_| Error::PeerParseError)
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<(Option<Id>, SocketAddr)>> {
        self.bootstrap_peers.iter().map(|peer| parse_peer(peer)).collect()
    }

    pub fn shared_keys(&self) -> Result<Vec<(Id, [u8; 32])>> {
        self.shared_keys.iter().map(|entry| parse_shared_key(entry)).collect()
    }

    /// A key store provisioned with the configured shared keys.
    pub fn key_store(&self) -> Result<MemoryKeyStore> {
        let keys = MemoryKeyStore::new();
        for (id, key) in self.shared_keys()? {
            keys.insert_shared_key(id, key);
        }
        Ok(keys)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn bootstrap_delta(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delta_ms.max(1))
    }
}

/// Parses a peer description of the form `IP` or `ID@IP`.
pub fn parse_peer(peer: &str) -> Result<(Option<Id>, SocketAddr)> {
    let parts: Vec<&str> = peer.split('@').collect();
    match parts.as_slice() {
        [ip] => Ok((None, ip.parse().map_err(|_| Error::PeerParseError)?)),
        [id, ip] => {
            let id: Id = id.parse().map_err(|_| Error::PeerParseError)?;
            Ok((Some(id), ip.parse().map_err(|_| Error::PeerParseError)?))
        }
        _ => Err(Error::PeerParseError),
    }
}

/// Parses a shared key of the form `ID:KEY`.
pub fn parse_shared_key(entry: &str) -> Result<(Id, [u8; 32])> {
    let (id, key) = entry.split_once(':').ok_or(Error::SharedKeyParseError)?;
    let id: Id = id.parse().map_err(|_| Error::SharedKeyParseError)?;
    let bytes = hex::decode(key.trim()).map_err(|_| Error::SharedKeyParseError)?;
    let key: [u8; 32] = bytes.try_into().map_err(|_| Error::SharedKeyParseError)?;
    Ok((id, key))
}
