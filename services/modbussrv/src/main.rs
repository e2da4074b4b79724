//! Modbus Service (`modbussrv`)

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ladder_modbus::{MemoryVariableStore, VariableStore};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modbussrv::bootstrap::{self, Args};
use modbussrv::{config, logging, MasterEngine, SlaveServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard =
        logging::init(&args.log_options()).context("Failed to initialize logging")?;

    let config = config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    if args.validate {
        info!(
            "Configuration valid: {:?} mode, {} of {} slot(s) occupied",
            config.framing_mode(),
            config.request_table()?.occupied_count(),
            config.requests.len()
        );
        let effective =
            serde_yaml::to_string(&config).context("Failed to render configuration")?;
        println!("{effective}");
        for line in bootstrap::describe_requests(&config) {
            println!("{line}");
        }
        return Ok(());
    }

    let store: Arc<dyn VariableStore> = Arc::new(MemoryVariableStore::new(&config.variables));
    let cancel = CancellationToken::new();
    let (run_tx, run_rx) = watch::channel(true);
    let mut tasks = Vec::new();

    if args.no_master {
        info!("Master engine disabled");
    } else {
        let mut engine = MasterEngine::from_config(config.clone(), store.clone())
            .context("Failed to create master engine")?;
        let mut status = engine.subscribe();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            engine.run(run_rx, cancel).await;
        }));
        tasks.push(tokio::spawn(async move {
            let mut raised = false;
            while status.changed().await.is_ok() {
                let snapshot = status.borrow_and_update().clone();
                if snapshot.comm_error != raised {
                    raised = snapshot.comm_error;
                    if raised {
                        warn!(
                            "Modbus communication error: {}",
                            snapshot.last_error.as_deref().unwrap_or("unknown")
                        );
                    } else {
                        info!("Modbus communication restored");
                    }
                }
            }
        }));
    }

    if args.no_slave || config.slave_port == 0 {
        info!("Slave server disabled");
    } else {
        let server = SlaveServer::bind(
            ("0.0.0.0", config.slave_port),
            store.clone(),
            config.slave_map.clone(),
            config.debug_level,
        )
        .await
        .with_context(|| format!("Failed to bind slave port {}", config.slave_port))?;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                error!("Slave server failed: {e}");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    drop(run_tx);

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {e}");
        }
    }
    info!("modbussrv stopped");
    Ok(())
}
