pub mod config;
pub mod error;
pub mod logging;
pub mod sftp;
pub mod ssh;
pub mod state;
pub mod storage;
pub mod tunnel;

#[cfg(test)]
mod test_utils;

pub use error::{AppError, AppResult};
pub use state::AppState;

use std::path::PathBuf;

/// Create the config directory layout and the activity log, then load state.
pub fn init(config_dir: Option<PathBuf>) -> anyhow::Result<AppState> {
    let config_dir = match config_dir {
        Some(dir) => dir,
        None => config::get_config_dir()?,
    };
    std::fs::create_dir_all(&config_dir)?;
    std::fs::create_dir_all(config_dir.join("logs"))?;

    tracing::info!("sshdock config dir: {:?}", config_dir);

    logging::init_log_manager(config_dir.join("logs"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log manager: {}", e))?;

    let state = AppState::new(&config_dir)?;
    tracing::debug!("sshdock initialized");
    Ok(state)
}
