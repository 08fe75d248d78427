//! Small filesystem helpers shared by the cache and key modules.

use std::path::Path;

use crate::acme::error::{AcmeError, Result};

/// Write `contents` to `path` via a temp file in the same directory followed
/// by a rename, so a crash mid-write never leaves a torn file in place.
/// `mode` is applied to the temp file before the rename (unix only).
///
/// Returns [`AcmeError::Storage`] on failure — every caller is itself inside
/// the `acme` error domain, so this stays in that domain rather than
/// `anyhow`'s.
pub async fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AcmeError::Storage("destination path has no parent directory".into()))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("fortify"),
        std::process::id()
    );
    let tmp_path = parent.join(tmp_name);

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    tokio::fs::rename(&tmp_path, path).await?;

    Ok(())
}

/// Ensure a directory exists, creating all parent components as needed.
pub async fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("creating directory {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_creates_file_with_contents() {
        let dir = std::env::temp_dir().join(format!("fortify-test-util-{}", std::process::id()));
        let path = dir.join("a").join("b.txt");

        atomic_write(&path, b"hello", 0o600).await.unwrap();
        let read_back = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(read_back, "hello");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn atomic_write_overwrites_existing_file() {
        let dir = std::env::temp_dir().join(format!("fortify-test-util2-{}", std::process::id()));
        let path = dir.join("c.txt");

        atomic_write(&path, b"first", 0o600).await.unwrap();
        atomic_write(&path, b"second", 0o600).await.unwrap();
        let read_back = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(read_back, "second");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
