use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const BUF_SIZE: usize = 1024 * 1024;

/// Content digest over every regular file under `root`.
///
/// Files are visited in sorted relative-path order; each contributes
/// its path bytes, a NUL, its content, and a NUL. Returns `None` when
/// the tree holds no files, so an empty capture is distinguishable
/// from any captured one.
pub fn files_digest(root: &Path) -> io::Result<Option<String>> {
    let files = files_for_digest(root)?;
    if files.is_empty() {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    for relpath in files {
        hasher.update(relpath.to_string_lossy().as_bytes());
        hasher.update(b"\x00");
        file_bytes_digest_update(&root.join(&relpath), &mut hasher)?;
        hasher.update(b"\x00");
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

fn files_for_digest(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(io::Error::from(e)),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relpath) = entry.path().strip_prefix(root) {
            files.push(relpath.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn file_bytes_digest_update(path: &Path, hasher: &mut Sha256) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}
