//! Slave Socket Server
//!
//! Sequential Modbus/TCP slave: one connection at a time, one request at a
//! time. Every request is answered by the slave dispatcher with the
//! transaction and unit ids echoed back.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ladder_modbus::{slave, MbapCodec, SlaveMap, VariableStore};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

pub struct SlaveServer {
    listener: TcpListener,
    store: Arc<dyn VariableStore>,
    map: SlaveMap,
    debug_level: u8,
}

impl SlaveServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        store: Arc<dyn VariableStore>,
        map: SlaveMap,
        debug_level: u8,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store,
            map,
            debug_level,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Modbus slave listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {e}");
                        continue;
                    },
                },
            };

            info!("Modbus master connected: {peer}");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.serve_connection(stream, peer) => {},
            }
            info!("Modbus master disconnected: {peer}");
        }

        info!("Modbus slave stopped");
        Ok(())
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }
        let mut framed = Framed::new(stream, MbapCodec);

        while let Some(next) = framed.next().await {
            let request = match next {
                Ok(request) => request,
                Err(e) => {
                    warn!("Dropping connection from {peer}: {e}");
                    return;
                },
            };
            if self.debug_level >= 2 {
                debug!(
                    "RX {peer} tid={} unit={} [{}]",
                    request.transaction_id,
                    request.unit_id,
                    hex::encode_upper(request.pdu.as_slice())
                );
            }

            let response = slave::handle_request(&request.pdu, self.store.as_ref(), &self.map);
            if self.debug_level >= 1 && response.is_exception() {
                warn!(
                    "Exception {:02X} for FC{:02X} from {peer}",
                    response.exception_code().unwrap_or(0),
                    request.pdu.function_code().unwrap_or(0)
                );
            }
            if self.debug_level >= 2 {
                debug!("TX {peer} [{}]", hex::encode_upper(response.as_slice()));
            }

            if let Err(e) = framed.send(request.reply(response)).await {
                warn!("Write to {peer} failed: {e}");
                return;
            }
        }
    }
}
