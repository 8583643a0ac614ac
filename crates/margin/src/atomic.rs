use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context as _};

/// Replaces `path` with `contents` through a sibling temp file and a rename, creating the
/// parent directory when needed. Readers see either the old file or the new one.
pub async fn write_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("path has no parent directory: {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create {}", parent.display()))?;

    let tmp = sibling_tmp_path(path);
    if let Err(err) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("write {}", tmp.display()));
    }

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()));
    }
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("margin");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    path.with_file_name(format!(".{file_name}.{}.{nonce}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_file_replaces_contents_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b.json");

        write_file(&path, b"one").await.unwrap();
        write_file(&path, b"two").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");

        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["b.json"]);
    }

    #[tokio::test]
    async fn failed_rename_removes_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::create_dir(&path).await.unwrap();
        tokio::fs::write(path.join("occupied"), b"x").await.unwrap();

        assert!(write_file(&path, b"data").await.is_err());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    #[test]
    fn tmp_path_is_hidden_sibling() {
        let tmp = sibling_tmp_path(Path::new("/var/margin/state.json"));
        assert_eq!(tmp.parent(), Some(Path::new("/var/margin")));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".state.json."));
        assert!(name.ends_with(".tmp"));
    }
}
