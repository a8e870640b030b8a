//! Stable per-install identifier, generated once and persisted in the
//! agent data directory.

use std::io;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

const INSTALL_ID_FILE: &str = "install_id";

/// Load the install id from `data_dir`, generating and persisting a new
/// one on first use.
pub fn load_or_create(data_dir: &Path) -> io::Result<String> {
    let path = data_dir.join(INSTALL_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(existing) => {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let id = Uuid::new_v4().to_string();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &id)?;
    info!(path = %path.display(), "generated new install id");
    Ok(id)
}
