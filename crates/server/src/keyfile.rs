//! Persistence of the server's static key.
//!
//! The key file holds the base64 export of [`ServerKey`] on a single line.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use protocol::ServerKey;

/// Reads the server key from `path`.
pub fn load(path: &Path) -> Result<ServerKey> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    ServerKey::from_base64(contents.trim())
        .with_context(|| format!("Invalid key file: {}", path.display()))
}

/// Writes `key` to `path`, creating parent directories.
///
/// On Unix the file is made readable by its owner only.
pub fn save(path: &Path, key: &ServerKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", key.to_base64()))
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict key file: {}", path.display()))?;
    }

    Ok(())
}

/// Loads the key at `path`, generating and saving a new one if it is missing.
pub fn load_or_generate(path: &Path) -> Result<ServerKey> {
    if path.exists() {
        return load(path);
    }
    let key = ServerKey::generate().context("Failed to generate server key")?;
    save(path, &key)?;
    tracing::info!("Generated new server key at {:?}", path);
    Ok(key)
}
