//! Master Polling Engine
//!
//! Owns the request table, the transport and the polling cursor, and keeps
//! exactly one request in flight. Each cycle selects a slot, builds and
//! frames its request, sends it, waits for the reply and stores the
//! result through the variable bridge.

use std::sync::Arc;
use std::time::Duration;

use ladder_modbus::{
    codec, frame, FramingMode, ModbusConfig, ModbusError, ModbusPdu, RequestBridge, RequestSlot,
    RequestTable, Target, VariableStore,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::cursor::PollingCursor;
use super::status::MasterStatus;
use crate::error::Result;
use crate::transport::{self, Transport, TransportError};

/// Pause between cycles when there is nothing to poll
const IDLE_PAUSE: Duration = Duration::from_millis(100);

/// Result of one polling cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No occupied slot
    Idle,
    /// Transport not ready, connect or send failed; the slot is retried
    Aborted { slot: usize, error: TransportError },
    /// Device not open
    NotReady(TransportError),
    Success { slot: usize },
    /// Counted failure; `forced_advance` when the error budget ran out
    Failed {
        slot: usize,
        error: String,
        forced_advance: bool,
    },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success { .. })
    }
}

/// Why a cycle that reached the send stage failed
enum CycleError {
    /// Request never reached the wire
    Abort(TransportError),
    /// Counts toward the error budget
    Fail(String),
}

impl From<ModbusError> for CycleError {
    fn from(err: ModbusError) -> Self {
        CycleError::Fail(err.to_string())
    }
}

pub struct MasterEngine {
    config: ModbusConfig,
    table: RequestTable,
    transport: Box<dyn Transport>,
    store: Arc<dyn VariableStore>,
    cursor: PollingCursor,
    status: watch::Sender<MasterStatus>,
}

impl MasterEngine {
    /// Engine with the transport selected by `config`
    pub fn from_config(config: ModbusConfig, store: Arc<dyn VariableStore>) -> Result<Self> {
        let transport = transport::from_config(&config);
        Self::new(config, transport, store)
    }

    pub fn new(
        config: ModbusConfig,
        transport: Box<dyn Transport>,
        store: Arc<dyn VariableStore>,
    ) -> Result<Self> {
        config.validate()?;
        let table = config.request_table()?;
        let (status, _) = watch::channel(MasterStatus::default());
        Ok(Self {
            config,
            table,
            transport,
            store,
            cursor: PollingCursor::new(),
            status,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<MasterStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> MasterStatus {
        self.status.borrow().clone()
    }

    pub fn cursor(&self) -> &PollingCursor {
        &self.cursor
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    /// Replace configuration and request table
    ///
    /// Requires `&mut self`, so the engine cannot be running. The cursor is
    /// reset; pooled connections to targets no longer referenced are closed.
    /// A change of transport selection replaces the transport.
    pub async fn reload(&mut self, config: ModbusConfig) -> Result<()> {
        config.validate()?;
        let table = config.request_table()?;

        if config.framing_mode() != self.config.framing_mode()
            || config.serial_port != self.config.serial_port
        {
            self.transport.close().await;
            self.transport = transport::from_config(&config);
        } else {
            let targets = referenced_targets(&config, &table);
            self.transport.retain_targets(&targets).await;
        }

        info!(
            "Master reloaded: {} of {} slots occupied",
            table.occupied_count(),
            table.len()
        );
        self.config = config;
        self.table = table;
        self.cursor.reset();
        Ok(())
    }

    /// Poll until cancelled
    ///
    /// `run_flag` is level-triggered: while it reads `false` the engine
    /// idles without touching the bus.
    pub async fn run(&mut self, mut run_flag: watch::Receiver<bool>, cancel: CancellationToken) {
        info!(
            "Master engine started ({:?}, {} slots occupied)",
            self.transport.framing(),
            self.table.occupied_count()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let running = *run_flag.borrow_and_update();
            if !running {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = run_flag.changed() => {
                        if changed.is_err() {
                            // Flag owner gone while stopped
                            break;
                        }
                        continue;
                    }
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            let pause = match outcome {
                CycleOutcome::Idle | CycleOutcome::NotReady(_) => {
                    self.config.inter_frame_delay().max(IDLE_PAUSE)
                },
                _ => self.config.inter_frame_delay(),
            };
            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        self.transport.close().await;
        info!("Master engine stopped");
    }

    /// Run exactly one polling cycle
    pub async fn poll_once(&mut self) -> CycleOutcome {
        if let Err(e) = self.transport.ensure_ready().await {
            debug!("Transport {} not ready: {}", self.transport.name(), e);
            let outcome = CycleOutcome::NotReady(e);
            self.publish(&outcome);
            return outcome;
        }

        let Some(index) = self.cursor.select(&self.table) else {
            let outcome = CycleOutcome::Idle;
            self.publish(&outcome);
            return outcome;
        };
        let Some(slot) = self.table.get(index).cloned() else {
            let outcome = CycleOutcome::Idle;
            self.publish(&outcome);
            return outcome;
        };
        if self.config.debug_level >= 3 {
            debug!("Cursor at slot #{} ({} -> {})", index, slot.function, slot.target_address);
        }

        let outcome = match self.exchange(&slot).await {
            Ok(()) => {
                self.cursor.record_success(&self.table);
                CycleOutcome::Success { slot: index }
            },
            Err(CycleError::Abort(error)) => {
                warn!("Slot #{} aborted: {}", index, error);
                CycleOutcome::Aborted { slot: index, error }
            },
            Err(CycleError::Fail(error)) => {
                let forced_advance = self.cursor.record_failure(&self.table);
                if self.config.debug_level >= 1 {
                    warn!("Slot #{} failed: {}", index, error);
                } else {
                    debug!("Slot #{} failed: {}", index, error);
                }
                if forced_advance {
                    warn!(
                        "Slot #{} skipped after {} consecutive errors",
                        index,
                        super::cursor::MAX_CONSECUTIVE_ERRORS
                    );
                }
                CycleOutcome::Failed {
                    slot: index,
                    error,
                    forced_advance,
                }
            },
        };

        if self.config.debug_level >= 3 {
            debug!("Cursor moved to {:?}", self.cursor.current());
        }
        self.publish(&outcome);
        outcome
    }

    /// Send the request of `slot` and apply its reply
    async fn exchange(&mut self, slot: &RequestSlot) -> std::result::Result<(), CycleError> {
        let target = self.config.target_of(&slot.target_address)?;
        let element_offset = self.config.element_offset;
        let bridge = RequestBridge::new(slot, &self.config.master_map, self.store.as_ref());

        let pdu = codec::build_request(slot, element_offset, &bridge)?;
        let function_code = slot.function.function_code();
        let (request, transaction_id) = match (&target, self.transport.framing()) {
            (Target::Rtu { slave }, FramingMode::Rtu) => (frame::encode_rtu(*slave, &pdu), None),
            (Target::Tcp { .. }, FramingMode::Tcp) => {
                let tid = self.cursor.next_transaction_id();
                (
                    frame::encode_tcp(tid, self.config.tcp_unit_id, &pdu),
                    Some(tid),
                )
            },
            _ => {
                return Err(CycleError::Fail(format!(
                    "target {} does not match {:?} transport",
                    target.endpoint(),
                    self.transport.framing()
                )))
            },
        };
        self.cursor.record_sent(function_code);

        if self.config.debug_level >= 2 {
            debug!("TX {} [{}]", target.endpoint(), hex::encode_upper(&request));
        }
        self.transport
            .send(&target, &request)
            .await
            .map_err(CycleError::Abort)?;

        let post_transmit = self.config.after_transmit_delay();
        if !post_transmit.is_zero() {
            tokio::time::sleep(post_transmit).await;
        }

        let expected = codec::expected_response_len(slot, function_code);
        let reply = self
            .transport
            .receive(&target, expected, self.config.response_timeout())
            .await
            .map_err(|e| CycleError::Fail(e.to_string()))?;
        if self.config.debug_level >= 2 {
            debug!("RX {} [{}]", target.endpoint(), hex::encode_upper(&reply));
        }

        let response: ModbusPdu = match (&target, transaction_id) {
            (Target::Rtu { slave }, _) => frame::decode_rtu(&reply, *slave)?,
            (Target::Tcp { .. }, Some(tid)) => frame::decode_tcp(&reply, tid)?.1,
            (Target::Tcp { .. }, None) => {
                return Err(CycleError::Fail("no transaction id outstanding".to_string()))
            },
        };

        codec::parse_response(
            self.cursor.last_function_code(),
            slot,
            element_offset,
            &response,
            &bridge,
        )?;
        trace!("Slot exchange with {} complete", target.endpoint());
        Ok(())
    }

    fn publish(&self, outcome: &CycleOutcome) {
        let current_slot = self.cursor.current();
        self.status.send_modify(|status| {
            status.current_slot = current_slot;
            match outcome {
                CycleOutcome::Idle => {},
                CycleOutcome::NotReady(error) => {
                    status.comm_error = true;
                    status.last_error = Some(error.to_string());
                },
                CycleOutcome::Success { .. } => {
                    status.cycles += 1;
                    status.successes += 1;
                    status.comm_error = false;
                },
                CycleOutcome::Aborted { error, .. } => {
                    status.cycles += 1;
                    status.aborted += 1;
                    status.comm_error = true;
                    status.last_error = Some(error.to_string());
                },
                CycleOutcome::Failed { error, .. } => {
                    status.cycles += 1;
                    status.failures += 1;
                    status.comm_error = true;
                    status.last_error = Some(error.clone());
                },
            }
        });
    }
}

impl std::fmt::Debug for MasterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterEngine")
            .field("transport", &self.transport)
            .field("slots", &self.table.occupied_count())
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Distinct targets of the occupied slots
fn referenced_targets(config: &ModbusConfig, table: &RequestTable) -> Vec<Target> {
    table
        .addresses()
        .into_iter()
        .filter_map(|address| config.target_of(address).ok())
        .collect()
}
