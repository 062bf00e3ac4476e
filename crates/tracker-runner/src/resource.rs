use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracker_core::ensure_dir;

use crate::config::{ResourceConfig, ResourceSource};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("downloading {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("extracting {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("resource i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolves one named requirement against its declared sources.
///
/// Each source is a zip archive fetched to the source's output
/// directory and extracted in place; an archive already on disk is
/// reused rather than re-fetched. Returns the selected paths keyed by
/// requirement name. Any failure is fatal to the operation before a
/// process is spawned.
pub fn resolve(
    requirement: &str,
    config: &ResourceConfig,
    base_dir: &Path,
) -> Result<BTreeMap<String, Vec<PathBuf>>, ResourceError> {
    let mut resolved: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for source in &config.sources {
        tracing::debug!(requirement, url = %source.url, "resolving resource source");
        let path = resolve_source(source, base_dir)?;
        resolved
            .entry(requirement.to_string())
            .or_default()
            .push(path);
    }
    Ok(resolved)
}

fn resolve_source(source: &ResourceSource, base_dir: &Path) -> Result<PathBuf, ResourceError> {
    let output_dir = base_dir.join(&source.output);
    ensure_dir(&output_dir).map_err(|e| ResourceError::Io {
        path: output_dir.clone(),
        source: e,
    })?;

    let archive_name = source.url.rsplit('/').next().unwrap_or("resource.zip");
    let archive_path = output_dir.join(archive_name);
    if !archive_path.exists() {
        download(&source.url, &archive_path)?;
        extract(&archive_path, &output_dir)?;
    }
    Ok(output_dir.join(&source.select))
}

fn download(url: &str, path: &Path) -> Result<(), ResourceError> {
    tracing::debug!(url, path = %path.display(), "downloading resource archive");
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|source| ResourceError::Download {
            url: url.to_string(),
            source,
        })?;
    let bytes = response.bytes().map_err(|source| ResourceError::Download {
        url: url.to_string(),
        source,
    })?;
    fs::write(path, &bytes).map_err(|source| ResourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn extract(archive_path: &Path, output_dir: &Path) -> Result<(), ResourceError> {
    tracing::debug!(path = %archive_path.display(), "extracting resource archive");
    let file = File::open(archive_path).map_err(|source| ResourceError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| ResourceError::Extract {
        path: archive_path.to_path_buf(),
        source,
    })?;
    archive
        .extract(output_dir)
        .map_err(|source| ResourceError::Extract {
            path: archive_path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "tracker_resource_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn zip_bytes(name: &str, content: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut buf = io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(name, zip::write::FileOptions::default())
                .expect("start file");
            writer.write_all(content).expect("entry content");
            writer.finish().expect("finish zip");
        }
        buf.into_inner()
    }

    #[test]
    fn present_archive_is_reused_without_fetching() {
        let root = temp_root("cached");
        let config = ResourceConfig {
            sources: vec![ResourceSource {
                // Unfetchable on purpose: the cached archive must win.
                url: "http://127.0.0.1:1/mnist.zip".to_string(),
                select: "mnist".to_string(),
                output: PathBuf::from("data"),
            }],
        };
        let archive = root.join("data").join("mnist.zip");
        fs::create_dir_all(archive.parent().unwrap()).expect("mkdir");
        fs::write(&archive, zip_bytes("mnist/train.csv", b"1,2,3\n")).expect("seed archive");

        let resolved = resolve("dataset", &config, &root).expect("resolve");
        assert_eq!(resolved["dataset"], vec![root.join("data").join("mnist")]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unreachable_source_is_a_download_error() {
        let root = temp_root("down");
        let config = ResourceConfig {
            sources: vec![ResourceSource {
                url: "http://127.0.0.1:1/mnist.zip".to_string(),
                select: "mnist".to_string(),
                output: PathBuf::from("data"),
            }],
        };
        match resolve("dataset", &config, &root) {
            Err(ResourceError::Download { url, .. }) => {
                assert!(url.ends_with("mnist.zip"))
            }
            other => panic!("expected Download error, got {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extraction_lands_under_the_output_dir() {
        let root = temp_root("extract");
        let archive = root.join("data").join("mnist.zip");
        fs::create_dir_all(archive.parent().unwrap()).expect("mkdir");
        fs::write(&archive, zip_bytes("mnist/train.csv", b"1,2,3\n")).expect("seed archive");
        extract(&archive, &root.join("data")).expect("extract");
        assert_eq!(
            fs::read(root.join("data/mnist/train.csv")).expect("read"),
            b"1,2,3\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
