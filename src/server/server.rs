use crate::connection::ConnectionManager;
use crate::Result;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use std::net::SocketAddr;
use std::sync::Arc;

/// Accepts inbound connections and hands them to the [ConnectionManager] for the handshake.
pub struct Server {
    listener: TcpListener,
    connections: Arc<ConnectionManager>,
}

impl Server {
    pub async fn bind(ip: SocketAddr, connections: Arc<ConnectionManager>) -> Result<Server> {
        let listener = TcpListener::bind(ip).await?;
        Ok(Server { listener, connections })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires.
    pub async fn listen(self, cancel: CancellationToken) -> Result<()> {
        info!("listening on {:?}", self.local_addr()?);
        loop {
            let (socket, address) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        continue;
                    }
                },
            };
            if let Err(err) = socket.set_nodelay(true) {
                debug!("nodelay on {}: {}", address, err);
            }
            let connections = self.connections.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = connections.establish(socket, Some(address), None, false).await {
                        warn!("inbound handshake failed: {:?}", err);
                    }
                }
                .instrument(info_span!("inbound", peer = %address)),
            );
        }
        info!("listener closed");
        Ok(())
    }
}
