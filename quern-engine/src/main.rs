// SPDX-License-Identifier: MIT

//! `quernd`: serve the worker wire protocol over a unix socket.

use quern_engine::error::Result;
use quern_engine::{interrupt, protocol, Settings, Store};
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    interrupt::install_signal_handlers()?;

    let settings = Settings::from_env()?;
    info!("store directory: {}", settings.store_dir.display());
    info!("state directory: {}", settings.state_dir.display());

    let store = Store::open(settings)?;
    if store.read_only() {
        info!("running in read-only mode");
    }

    let socket_path = store.settings().socket_path();
    let result = protocol::serve(&store, &socket_path);

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    result
}
