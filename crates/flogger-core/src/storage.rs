//! File system helpers: directories, YAML config I/O, entry artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Create the subdirectory an entry name encodes (`"train/loss"` → `<root>/train`).
/// Entries without a separator need nothing.
pub fn ensure_entry_dir(root: &Path, entry: &str) -> Result<()> {
    match Path::new(entry).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(&root.join(parent)),
        _ => Ok(()),
    }
}

/// `<root>/<entry>.<ext>`; the entry may contain separators.
pub fn entry_file(root: &Path, entry: &str, ext: &str) -> PathBuf {
    root.join(format!("{entry}.{ext}"))
}

// ─── YAML config I/O ─────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    let val = serde_yaml::from_str(&content)?;
    Ok(val)
}

// ─── Entry artifacts ─────────────────────────────────────────────────────────

pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_json::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn write_text(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entry_dir_is_created_only_for_nested_names() {
        let tmp = TempDir::new().unwrap();
        ensure_entry_dir(tmp.path(), "loss").unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);

        ensure_entry_dir(tmp.path(), "train/deep/loss").unwrap();
        assert!(tmp.path().join("train/deep").is_dir());
        assert!(!tmp.path().join("train/deep/loss").exists());
    }

    #[test]
    fn missing_yaml_yields_default() {
        let tmp = TempDir::new().unwrap();
        let value: Vec<String> = load_yaml(&tmp.path().join("absent.yaml")).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn entry_file_keeps_nested_entry() {
        let path = entry_file(Path::new("/tmp/run"), "train/loss", "json");
        assert_eq!(path, PathBuf::from("/tmp/run/train/loss.json"));
    }
}
