//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `aimos_core` linkage with deterministic output.
//! - With a data root argument, start store logging, open the configured
//!   store and report it.

use aimos_core::{default_log_level, init_logging_for_store, open_store, StoreConfig};
use log::info;
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("aimos_core ping={}", aimos_core::ping());
    println!("aimos_core version={}", aimos_core::core_version());

    let Some(data_root) = std::env::args().nth(1) else {
        return ExitCode::SUCCESS;
    };
    match probe_store(&data_root) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("aimos_core store error={message}");
            ExitCode::FAILURE
        }
    }
}

fn probe_store(data_root: &str) -> Result<(), String> {
    let config = StoreConfig::from_env(data_root).map_err(|err| err.to_string())?;
    init_logging_for_store(default_log_level(), &config)?;
    let store = open_store(&config).map_err(|err| err.to_string())?;
    let atoms = store.count_atoms().map_err(|err| err.to_string())?;
    info!(
        "event=cli_probe module=cli status=ok backend={} atoms={atoms}",
        config.backend.as_str()
    );
    println!("aimos_core backend={}", config.backend.as_str());
    println!("aimos_core atoms={atoms}");
    Ok(())
}
