use crate::fsutil::ensure_dir;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Attribute values are YAML scalars, mappings, or sequences.
pub type AttrValue = serde_yaml::Value;

#[derive(Debug, Error)]
pub enum AttrError {
    #[error("attribute not found: {0}")]
    NotFound(String),
    #[error("attribute {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("decoding attribute {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("encoding attribute {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Per-run key/value store, one YAML file per attribute name.
///
/// Reads always re-open the file so a consumer in another process (a
/// `watch` tailing a run it did not start) sees the latest on-disk
/// state. Writes are unconditional whole-file overwrites; there is no
/// transaction across attributes.
#[derive(Debug, Clone)]
pub struct AttrStore {
    dir: PathBuf,
}

impl AttrStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn attr_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write(&self, name: &str, value: &AttrValue) -> Result<(), AttrError> {
        ensure_dir(&self.dir).map_err(|source| AttrError::Io {
            name: name.to_string(),
            source,
        })?;
        let encoded = serde_yaml::to_string(value).map_err(|source| AttrError::Encode {
            name: name.to_string(),
            source,
        })?;
        fs::write(self.attr_path(name), encoded).map_err(|source| AttrError::Io {
            name: name.to_string(),
            source,
        })
    }

    pub fn read(&self, name: &str) -> Result<AttrValue, AttrError> {
        let raw = match fs::read_to_string(self.attr_path(name)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AttrError::NotFound(name.to_string()))
            }
            Err(source) => {
                return Err(AttrError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };
        serde_yaml::from_str(&raw).map_err(|source| AttrError::Decode {
            name: name.to_string(),
            source,
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.attr_path(name).exists()
    }

    /// Sorted names of all attributes present on disk.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Best-effort delete; a missing attribute is not an error.
    pub fn delete(&self, name: &str) {
        let _ = fs::remove_file(self.attr_path(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_yaml::Value;

    fn temp_store(tag: &str) -> (PathBuf, AttrStore) {
        let root = std::env::temp_dir().join(format!(
            "tracker_attr_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let store = AttrStore::new(root.join("attrs"));
        (root, store)
    }

    #[test]
    fn mapping_round_trips() {
        let (root, store) = temp_store("roundtrip");
        let value: Value =
            serde_yaml::from_str("lr: 0.01\nepochs: 5\n").expect("parse mapping");
        store.write("parameters", &value).expect("write");
        let read = store.read("parameters").expect("read");
        assert_eq!(read, value);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_attribute_is_not_found() {
        let (root, store) = temp_store("missing");
        match store.read("nope") {
            Err(AttrError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected NotFound, got {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_value_is_distinct_from_missing() {
        let (root, store) = temp_store("empty");
        store.write("label", &Value::Null).expect("write null");
        assert!(store.exists("label"));
        assert!(store.read("label").is_ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn names_are_sorted() {
        let (root, store) = temp_store("names");
        for name in ["zeta", "alpha", "mid"] {
            store
                .write(name, &Value::String("x".to_string()))
                .expect("write");
        }
        assert_eq!(store.names(), vec!["alpha", "mid", "zeta"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn writes_overwrite_unconditionally() {
        let (root, store) = temp_store("overwrite");
        store
            .write("exit_status", &Value::Number(1.into()))
            .expect("first");
        store
            .write("exit_status", &Value::Number(0.into()))
            .expect("second");
        assert_eq!(
            store.read("exit_status").expect("read"),
            Value::Number(0.into())
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn delete_is_idempotent() {
        let (root, store) = temp_store("delete");
        store
            .write("tmp", &Value::String("v".to_string()))
            .expect("write");
        store.delete("tmp");
        store.delete("tmp");
        assert!(!store.exists("tmp"));
        let _ = fs::remove_dir_all(root);
    }
}
