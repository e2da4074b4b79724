//! Mock Transport for Testing
//!
//! Canned replies and a record of sent frames, so the polling engine can be
//! driven without a serial line or sockets. Clones share state: keep one
//! handle in the test and give the other to the engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ladder_modbus::{FramingMode, Target};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{Transport, TransportError};

/// Mock transport state
#[derive(Debug, Default)]
struct MockTransportState {
    /// Replies handed out by `receive`, in order; empty means timeout
    receive_queue: VecDeque<Result<Vec<u8>, TransportError>>,
    /// Frames passed to `send`
    sent_data: Vec<(Target, Vec<u8>)>,
    /// Clock readings at each `send` and `receive` call
    send_times: Vec<Instant>,
    receive_times: Vec<Instant>,
    /// Targets passed to the last `retain_targets`
    retained: Option<Vec<Target>>,
    fail_ready: bool,
    fail_send: bool,
}

/// Mock transport implementation
#[derive(Debug, Clone)]
pub struct MockTransport {
    framing: FramingMode,
    state: Arc<RwLock<MockTransportState>>,
}

impl MockTransport {
    pub fn new(framing: FramingMode) -> Self {
        Self {
            framing,
            state: Arc::new(RwLock::new(MockTransportState::default())),
        }
    }

    /// Queue a reply frame
    pub async fn add_receive_data(&self, data: Vec<u8>) {
        self.state.write().await.receive_queue.push_back(Ok(data));
    }

    /// Queue a receive failure
    pub async fn add_receive_error(&self, error: TransportError) {
        self.state.write().await.receive_queue.push_back(Err(error));
    }

    /// All frames sent so far
    pub async fn get_sent_data(&self) -> Vec<(Target, Vec<u8>)> {
        self.state.read().await.sent_data.clone()
    }

    pub async fn send_times(&self) -> Vec<Instant> {
        self.state.read().await.send_times.clone()
    }

    pub async fn receive_times(&self) -> Vec<Instant> {
        self.state.read().await.receive_times.clone()
    }

    pub async fn clear_sent_data(&self) {
        self.state.write().await.sent_data.clear();
    }

    pub async fn pending_replies(&self) -> usize {
        self.state.read().await.receive_queue.len()
    }

    pub async fn retained_targets(&self) -> Option<Vec<Target>> {
        self.state.read().await.retained.clone()
    }

    pub async fn set_ready_failure(&self, should_fail: bool) {
        self.state.write().await.fail_ready = should_fail;
    }

    pub async fn set_send_failure(&self, should_fail: bool) {
        self.state.write().await.fail_send = should_fail;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn framing(&self) -> FramingMode {
        self.framing
    }

    fn name(&self) -> &str {
        "mock"
    }

    async fn ensure_ready(&mut self) -> Result<(), TransportError> {
        if self.state.read().await.fail_ready {
            return Err(TransportError::NotReady("mock device closed".to_string()));
        }
        Ok(())
    }

    async fn send(&mut self, target: &Target, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        if state.fail_send {
            return Err(TransportError::SendFailed("mock send failure".to_string()));
        }
        debug!("Mock send to {}: {} bytes", target.endpoint(), frame.len());
        state.sent_data.push((target.clone(), frame.to_vec()));
        state.send_times.push(Instant::now());
        Ok(())
    }

    async fn receive(
        &mut self,
        target: &Target,
        _expected_pdu_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let next = {
            let mut state = self.state.write().await;
            state.receive_times.push(Instant::now());
            state.receive_queue.pop_front()
        };
        next.unwrap_or_else(|| {
            Err(TransportError::Timeout(format!(
                "no reply from {} within {:?}",
                target.endpoint(),
                timeout
            )))
        })
    }

    async fn retain_targets(&mut self, targets: &[Target]) {
        self.state.write().await.retained = Some(targets.to_vec());
    }
}
