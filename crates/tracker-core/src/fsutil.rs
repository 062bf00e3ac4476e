use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Whole-file write through a temp file plus rename, so readers never
/// observe a half-written value.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Reads a file to a string, mapping every failure to `None`.
pub fn try_read_to_string(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// RFC 3339 timestamp used for the `initialized`/`started`/`stopped`
/// attributes.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "tracker_fsutil_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    #[test]
    fn atomic_write_creates_parents_and_overwrites() {
        let root = temp_root("atomic");
        let target = root.join("a").join("b").join("value");
        atomic_write_bytes(&target, b"one").expect("first write");
        assert_eq!(fs::read(&target).unwrap(), b"one");
        atomic_write_bytes(&target, b"two").expect("overwrite");
        assert_eq!(fs::read(&target).unwrap(), b"two");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sha256_file_matches_bytes_digest() {
        let root = temp_root("sha");
        let target = root.join("data");
        fs::write(&target, b"hello tracker").unwrap();
        assert_eq!(
            sha256_file(&target).unwrap(),
            sha256_bytes(b"hello tracker")
        );
        let _ = fs::remove_dir_all(root);
    }
}
