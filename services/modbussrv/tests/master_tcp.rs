//! Master engine in TCP mode against the slave server

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use ladder_modbus::{
    MemoryVariableStore, ModbusConfig, RequestKind, RequestSlot, SlaveMap, VarKind,
    VariableCounts, VariableStore,
};
use modbussrv::{CycleOutcome, MasterEngine, SlaveServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn start_slave(store: Arc<MemoryVariableStore>) -> (String, CancellationToken) {
    let server = SlaveServer::bind("127.0.0.1:0", store, SlaveMap::default(), 0)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (addr, cancel)
}

fn slot(target: &str, function: RequestKind, first: u32, count: u16, offset: usize) -> RequestSlot {
    RequestSlot {
        target_address: target.to_string(),
        function,
        first_element: first,
        element_count: count,
        variable_offset: offset,
        ..RequestSlot::default()
    }
}

#[tokio::test]
async fn test_master_reads_and_writes_through_slave() {
    let slave_store = Arc::new(MemoryVariableStore::new(&VariableCounts::default()));
    slave_store.write_variable(VarKind::PhysWordInput, 2, 1500);
    slave_store.write_variable(VarKind::PhysWordInput, 3, 1501);
    let (addr, cancel) = start_slave(slave_store.clone()).await;

    let config = ModbusConfig {
        element_offset: 1,
        inter_frame_delay_ms: 0,
        response_timeout_ms: 1000,
        requests: vec![
            slot(&addr, RequestKind::ReadInputRegisters, 3, 2, 0),
            slot(&addr, RequestKind::WriteMultipleCoils, 1, 3, 20),
        ],
        ..ModbusConfig::default()
    };
    let master_store = Arc::new(MemoryVariableStore::new(&VariableCounts::default()));
    master_store.write_variable(VarKind::MemBit, 20, 1);
    master_store.write_variable(VarKind::MemBit, 22, 1);

    let mut engine = MasterEngine::from_config(config, master_store.clone()).unwrap();
    assert_eq!(engine.poll_once().await, CycleOutcome::Success { slot: 0 });
    assert_eq!(master_store.read_variable(VarKind::MemWord, 0), 1500);
    assert_eq!(master_store.read_variable(VarKind::MemWord, 1), 1501);

    assert_eq!(engine.poll_once().await, CycleOutcome::Success { slot: 1 });
    assert_eq!(&slave_store.snapshot(VarKind::MemBit)[..3], &[1, 0, 1]);

    assert_eq!(engine.status().successes, 2);
    assert!(!engine.status().comm_error);
    cancel.cancel();
}

#[tokio::test]
async fn test_silent_device_does_not_stall_the_table() {
    // Accepts connections but never answers
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            held.push(socket);
        }
    });

    let slave_store = Arc::new(MemoryVariableStore::new(&VariableCounts::default()));
    slave_store.write_variable(VarKind::MemWord, 0, 77);
    let (addr, cancel) = start_slave(slave_store).await;

    let config = ModbusConfig {
        inter_frame_delay_ms: 0,
        response_timeout_ms: 100,
        requests: vec![
            slot(&silent_addr, RequestKind::ReadHoldingRegisters, 0, 1, 0),
            slot(&addr, RequestKind::ReadHoldingRegisters, 0, 1, 5),
        ],
        ..ModbusConfig::default()
    };
    let master_store = Arc::new(MemoryVariableStore::new(&VariableCounts::default()));
    let mut engine = MasterEngine::from_config(config, master_store.clone()).unwrap();

    for _ in 0..3 {
        assert!(matches!(
            engine.poll_once().await,
            CycleOutcome::Failed { slot: 0, .. }
        ));
    }
    assert!(engine.status().comm_error);

    assert_eq!(engine.poll_once().await, CycleOutcome::Success { slot: 1 });
    assert_eq!(master_store.read_variable(VarKind::MemWord, 5), 77);
    assert!(!engine.status().comm_error);

    // Back to the silent device on the next lap
    let next = tokio::time::timeout(Duration::from_secs(2), engine.poll_once())
        .await
        .unwrap();
    assert!(matches!(next, CycleOutcome::Failed { slot: 0, .. }));
    cancel.cancel();
}

#[tokio::test]
async fn test_unreachable_device_retries_without_counting() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap().to_string();
    drop(closed);

    let config = ModbusConfig {
        inter_frame_delay_ms: 0,
        connect_timeout_ms: 500,
        requests: vec![slot(&closed_addr, RequestKind::ReadCoils, 0, 1, 0)],
        ..ModbusConfig::default()
    };
    let store = Arc::new(MemoryVariableStore::new(&VariableCounts::default()));
    let mut engine = MasterEngine::from_config(config, store).unwrap();

    for _ in 0..4 {
        assert!(matches!(
            engine.poll_once().await,
            CycleOutcome::Aborted { slot: 0, .. }
        ));
    }
    assert_eq!(engine.cursor().consecutive_errors(), 0);
    assert_eq!(engine.status().aborted, 4);
}
