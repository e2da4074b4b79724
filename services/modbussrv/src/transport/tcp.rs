//! Modbus/TCP Transport
//!
//! Connections are pooled per target and reused across cycles. The pool
//! is bounded by the request table size; when every entry belongs to
//! another target the send is refused for this cycle.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ladder_modbus::{FramingMode, MbapHeader, Target};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::traits::{Transport, TransportError};

/// Bounded set of open connections, at most one per target
#[derive(Debug)]
pub struct ConnectionPool {
    capacity: usize,
    connect_timeout: Duration,
    connections: HashMap<Target, TcpStream>,
}

impl ConnectionPool {
    pub fn new(capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            capacity,
            connect_timeout,
            connections: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.connections.contains_key(target)
    }

    /// Pooled connection for `target`, opening one if a slot is free
    pub async fn get_or_connect(
        &mut self,
        target: &Target,
    ) -> Result<&mut TcpStream, TransportError> {
        if !self.connections.contains_key(target) {
            if self.connections.len() >= self.capacity {
                return Err(TransportError::PoolExhausted(format!(
                    "{} connections open, cannot add {}",
                    self.connections.len(),
                    target.endpoint()
                )));
            }
            let stream = self.connect(target).await?;
            self.connections.insert(target.clone(), stream);
        }
        self.connections.get_mut(target).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("{} not in pool", target.endpoint()))
        })
    }

    /// Existing connection for `target`
    pub fn get_mut(&mut self, target: &Target) -> Option<&mut TcpStream> {
        self.connections.get_mut(target)
    }

    async fn connect(&self, target: &Target) -> Result<TcpStream, TransportError> {
        let Target::Tcp { host, port } = target else {
            return Err(TransportError::InvalidTarget(format!(
                "{} is not a TCP endpoint",
                target.endpoint()
            )));
        };
        let addr = target.endpoint();
        debug!("Connecting to TCP endpoint: {addr}");

        match timeout(self.connect_timeout, TcpStream::connect((host.as_str(), *port))).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {e}");
                }
                info!("Connected to {addr}");
                Ok(stream)
            },
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
                "failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "connection to {addr} timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Close the connection to `target`
    pub fn evict(&mut self, target: &Target) {
        if self.connections.remove(target).is_some() {
            debug!("Evicted connection to {}", target.endpoint());
        }
    }

    /// Close connections whose target is not in `targets`
    pub fn retain_referenced(&mut self, targets: &[Target]) {
        self.connections.retain(|target, _| {
            let keep = targets.contains(target);
            if !keep {
                debug!("Dropping unreferenced connection to {}", target.endpoint());
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}

/// Discard bytes already buffered on the socket
fn drain_stale(stream: &TcpStream) -> usize {
    let mut scratch = [0u8; 256];
    let mut drained = 0;
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
    drained
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    pool: ConnectionPool,
}

impl TcpTransport {
    pub fn new(pool_capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            pool: ConnectionPool::new(pool_capacity, connect_timeout),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn read_frame(
        stream: &mut TcpStream,
        deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let mut frame = vec![0u8; MbapHeader::SIZE];
        read_exact_until(stream, &mut frame, deadline).await?;
        let header = MbapHeader::parse(&frame)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        frame.resize(MbapHeader::SIZE + header.pdu_len(), 0);
        read_exact_until(stream, &mut frame[MbapHeader::SIZE..], deadline).await?;
        Ok(frame)
    }
}

async fn read_exact_until(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), TransportError> {
    match timeout_at(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            TransportError::ReceiveFailed("connection closed by peer".to_string()),
        ),
        Ok(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
        Err(_) => Err(TransportError::Timeout("no complete reply".to_string())),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn framing(&self) -> FramingMode {
        FramingMode::Tcp
    }

    fn name(&self) -> &str {
        "tcp"
    }

    async fn ensure_ready(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&mut self, target: &Target, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.pool.get_or_connect(target).await?;
        let stale = drain_stale(stream);
        if stale > 0 {
            debug!("Discarded {} stale byte(s) from {}", stale, target.endpoint());
        }
        let written = stream.write_all(frame).await;
        if let Err(e) = written {
            self.pool.evict(target);
            return Err(TransportError::SendFailed(format!(
                "write to {} failed: {e}",
                target.endpoint()
            )));
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        target: &Target,
        _expected_pdu_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let stream = self.pool.get_mut(target).ok_or_else(|| {
            TransportError::ReceiveFailed(format!("no connection to {}", target.endpoint()))
        })?;
        let result = Self::read_frame(stream, deadline).await;
        match result {
            Ok(frame) => Ok(frame),
            Err(TransportError::Timeout(msg)) => Err(TransportError::Timeout(format!(
                "{} from {} within {:?}",
                msg,
                target.endpoint(),
                timeout
            ))),
            Err(e) => {
                self.pool.evict(target);
                Err(e)
            },
        }
    }

    async fn retain_targets(&mut self, targets: &[Target]) {
        self.pool.retain_referenced(targets);
    }

    async fn close(&mut self) {
        self.pool.clear();
    }
}
