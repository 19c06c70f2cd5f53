pub mod connections;
pub mod settings;

pub use connections::*;
pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Get the sshdock config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("sshdock");

    Ok(config_dir)
}

/// Default storage root for synced and opened files
pub fn get_data_dir() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find data directory".into()))?
        .join("sshdock");

    Ok(data_dir)
}
