//! Place server: live canvas backend.
//!
//! Wires the change log, the write coordinator, the live-feed reader, the
//! compactor, the HTTP API and the WebSocket viewer endpoint together from
//! `PLACE_*` environment variables.
//!
//! `place-server --reset-board` overwrites the board with a blank one and
//! exits.

mod http;

use std::sync::Arc;

use log::{error, info, warn};

use place_collab::{
    BroadcastGroup, Broadcaster, ChangeLogReader, Compactor, MemoryStore, PlaceStore, ReaderExit,
    ServiceConfig, ViewerServer,
};
use place_core::FillMode;

use crate::http::{AppState, Backend};

/// Default background color for a reset board.
const RESET_COLOR: u8 = 0x3;

/// Largest frame pushed to viewers.
const MAX_PUSH_BYTES: usize = 16 << 20;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    let reset = std::env::args().any(|arg| arg == "--reset-board");

    info!(
        "Starting place server (viewers on {}, HTTP API on {})...",
        config.bind_addr, config.http_addr
    );

    let result = match config.store_config() {
        Some(store_config) => match PlaceStore::open(store_config) {
            Ok(store) => run(Arc::new(store), config, reset).await,
            Err(e) => Err(format!("could not open store: {e}")),
        },
        None => {
            warn!("PLACE_STORAGE_PATH not set, state is kept in memory only");
            run(Arc::new(MemoryStore::new()), config, reset).await
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run<S: Backend>(store: Arc<S>, config: ServiceConfig, reset: bool) -> Result<(), String> {
    let compactor = Arc::new(Compactor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        config.compactor_config(),
    ));

    if reset {
        let tail = compactor
            .reset(&FillMode::Solid(RESET_COLOR))
            .await
            .map_err(|e| format!("board reset failed: {e}"))?;
        info!("Board reset; live updates resume at sequence {tail}");
        return Ok(());
    }

    // Make sure a board exists before the first viewer asks for it.
    let report = compactor
        .compact_once()
        .await
        .map_err(|e| format!("initial compaction failed: {e}"))?;
    info!("Initial compaction: {report:?}");

    let server_config = config.server_config();
    let group = Arc::new(BroadcastGroup::new(server_config.broadcast_capacity));
    let broadcaster =
        Arc::new(Broadcaster::new(group.clone()).with_max_payload(MAX_PUSH_BYTES));

    let reader = ChangeLogReader::with_cursors(
        store.clone(),
        broadcaster,
        store.clone(),
        config.reader_config(),
    );
    let reader_task = reader.start();
    let compactor_task = compactor.start_periodic(config.compaction_interval);

    let http_addr = config.http_addr.clone();
    let app = Arc::new(AppState::new(store, config));
    let server = ViewerServer::new(server_config, group);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Viewer server failed: {e}");
            }
        }
        result = http::serve(&http_addr, app) => {
            if let Err(e) = result {
                error!("HTTP API failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    reader.stop();
    compactor.stop();
    if let Some(task) = reader_task {
        match task.await {
            Ok(ReaderExit::Fatal(e)) => error!("Change log reader stopped: {e}"),
            Ok(ReaderExit::Stopped) => info!("Change log reader stopped"),
            Err(e) => error!("Change log reader task failed: {e}"),
        }
    }
    if let Err(e) = compactor_task.await {
        error!("Compactor task failed: {e}");
    }
    Ok(())
}
