use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use assetflow::config::{load_config, Config};
use assetflow::db::Database;
use assetflow::engine::{Engine, EngineOptions};
use assetflow::extraction::{build_extractor, seed_api_key, TextExtractor};
use assetflow::logging::init_logging;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("assetflowd failed: {}", e);
            eprintln!("assetflowd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    // Usage: assetflowd [config.json]
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    init_logging(&config.logging)?;
    info!("Starting assetflowd v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database_path()?;
    info!("Using database {:?}", db_path);
    let db = Database::open(&db_path)?;

    if let Some(key) = config.api_key()? {
        if seed_api_key(&db, &key)? {
            info!("Stored extraction API key from configuration");
        }
    }

    let extractor: Arc<dyn TextExtractor> = Arc::from(build_extractor(&config.extraction.backend)?);
    let engine = Engine::builder(db, extractor)
        .options(EngineOptions::from_config(&config))
        .build()?;

    engine.run_startup_recovery();

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    info!("assetflowd ready, press Ctrl-C to stop");
    let _ = stop_rx.recv();

    engine.shutdown();
    Ok(())
}
