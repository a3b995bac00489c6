use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;
use tokio::fs;

const KEY_FILE_MODE: u32 = 0o600;
const KEY_DIR_MODE: u32 = 0o700;

/// Ensures the directory holding key files exists and has secure permissions.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub async fn ensure_key_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create key dir {}: {e}", path.display()))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_DIR_MODE))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set key dir permissions: {e}"))?;
    Ok(())
}

/// Applies restrictive permissions to a private key file.
///
/// # Errors
/// Returns an error if permissions cannot be set.
pub async fn set_key_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_FILE_MODE))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set key file permissions: {e}"))?;
    Ok(())
}

/// Writes a public file such as a certificate, creating its directory.
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot be written.
pub async fn write_public(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path {} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create dir {}: {e}", dir.display()))?;
    fs::write(path, contents)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
    Ok(())
}

/// Writes a private key readable by the owner only.
///
/// # Errors
/// Returns an error if the directory cannot be secured, the file cannot be written,
/// or key permissions cannot be applied.
pub async fn write_private(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Key path {} has no parent directory", path.display()))?;
    ensure_key_dir(dir).await?;
    fs::write(path, contents)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write key file {}: {e}", path.display()))?;
    set_key_permissions(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn test_ensure_key_dir_permissions() {
        let dir = tempdir().unwrap();
        let key_dir = dir.path().join("jws");

        ensure_key_dir(&key_dir).await.unwrap();

        assert_eq!(mode(&key_dir), KEY_DIR_MODE);
    }

    #[tokio::test]
    async fn test_write_public_creates_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound").join("ca.pem");

        write_public(&path, "ca-data").await.unwrap();

        assert_eq!(fs::read_to_string(&path).await.unwrap(), "ca-data");
    }

    #[tokio::test]
    async fn test_write_private_restricts_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inbound").join("key.pem");

        write_private(&path, "key-data").await.unwrap();
        write_private(&path, "key-data-2").await.unwrap();

        assert_eq!(fs::read_to_string(&path).await.unwrap(), "key-data-2");
        assert_eq!(mode(&path), KEY_FILE_MODE);
        assert_eq!(mode(path.parent().unwrap()), KEY_DIR_MODE);
    }
}
