use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use tracing::{debug, error, warn};

/// An error raised by a non-volatile store.
#[derive(Debug, thiserror::Error)]
pub enum NvramError {
    /// The key is absent.
    #[error("Key `{0}` not found")]
    NotFound(String),
    /// The key holds a value of another type.
    #[error("Key `{0}` does not hold an integer")]
    Parse(String),
    /// The store could not be written.
    #[error("NVRAM input/output error: {0}")]
    Io(#[from] std::io::Error),
}

/// A non-volatile key-value store.
///
/// Provides the defaults applied on cold boots, such as the port of a server
/// session.
pub trait Nvram: Send + Sync {
    /// Reads an integer.
    ///
    /// # Errors
    ///
    /// Returns [`NvramError::NotFound`] when the key is absent.
    fn read_int(&self, key: &str) -> Result<i32, NvramError>;

    /// Reads a string.
    fn read_string(&self, key: &str) -> Option<String>;

    /// Writes an integer.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be persisted.
    fn write_int(&self, key: &str, value: i32) -> Result<(), NvramError>;

    /// Writes a string.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be persisted.
    fn write_string(&self, key: &str, value: &str) -> Result<(), NvramError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Value {
    Int(i32),
    Text(String),
}

type Entries = HashMap<String, Value>;

fn read_int(entries: &Entries, key: &str) -> Result<i32, NvramError> {
    match entries.get(key) {
        Some(Value::Int(value)) => Ok(*value),
        Some(Value::Text(text)) => text
            .trim()
            .parse()
            .map_err(|_| NvramError::Parse(key.to_owned())),
        None => Err(NvramError::NotFound(key.to_owned())),
    }
}

fn read_string(entries: &Entries, key: &str) -> Option<String> {
    match entries.get(key)? {
        Value::Int(value) => Some(value.to_string()),
        Value::Text(text) => Some(text.clone()),
    }
}

/// A volatile [`Nvram`], for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryNvram {
    entries: Mutex<Entries>,
}

impl MemoryNvram {
    /// Creates an empty [`MemoryNvram`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Nvram for MemoryNvram {
    fn read_int(&self, key: &str) -> Result<i32, NvramError> {
        read_int(&self.entries.lock().unwrap_or_else(PoisonError::into_inner), key)
    }

    fn read_string(&self, key: &str) -> Option<String> {
        read_string(&self.entries.lock().unwrap_or_else(PoisonError::into_inner), key)
    }

    fn write_int(&self, key: &str, value: i32) -> Result<(), NvramError> {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), Value::Int(value));
        Ok(())
    }

    fn write_string(&self, key: &str, value: &str) -> Result<(), NvramError> {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), Value::Text(value.to_owned()));
        Ok(())
    }
}

/// An [`Nvram`] persisted as a `JSON` object in a file.
///
/// Every write rewrites the whole file.
#[derive(Debug)]
pub struct JsonNvram {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl JsonNvram {
    /// Opens the store at `path`.
    ///
    /// A missing file yields an empty store, a malformed one is ignored.
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("NVRAM file `{}` is malformed, ignore it: {e}", path.display());
                Entries::new()
            }),
            Err(e) => {
                debug!("No NVRAM file `{}`: {e}", path.display());
                Entries::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn update(&self, key: &str, value: Value) -> Result<(), NvramError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = entries.insert(key.to_owned(), value);

        let bytes = serde_json::to_vec_pretty(&*entries).map_err(std::io::Error::from)?;
        fs::write(&self.path, bytes).map_err(|e| {
            error!("Impossible to write `{}`: {e}", self.path.display());
            NvramError::Io(e)
        })
    }
}

impl Nvram for JsonNvram {
    fn read_int(&self, key: &str) -> Result<i32, NvramError> {
        read_int(&self.entries.lock().unwrap_or_else(PoisonError::into_inner), key)
    }

    fn read_string(&self, key: &str) -> Option<String> {
        read_string(&self.entries.lock().unwrap_or_else(PoisonError::into_inner), key)
    }

    fn write_int(&self, key: &str, value: i32) -> Result<(), NvramError> {
        self.update(key, Value::Int(value))
    }

    fn write_string(&self, key: &str, value: &str) -> Result<(), NvramError> {
        self.update(key, Value::Text(value.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store() {
        let nvram = MemoryNvram::new();
        assert!(matches!(
            nvram.read_int("DPM_SERVER_PORT"),
            Err(NvramError::NotFound(_))
        ));

        nvram.write_int("DPM_SERVER_PORT", 9000).unwrap();
        nvram.write_string("DPM_SERVER_ADDR", "10.0.0.2").unwrap();
        nvram.write_string("DPM_RETRY", " 3 ").unwrap();

        assert_eq!(nvram.read_int("DPM_SERVER_PORT").unwrap(), 9000);
        assert_eq!(nvram.read_string("DPM_SERVER_PORT").as_deref(), Some("9000"));
        assert_eq!(nvram.read_string("DPM_SERVER_ADDR").as_deref(), Some("10.0.0.2"));
        assert_eq!(nvram.read_int("DPM_RETRY").unwrap(), 3);
        assert!(matches!(
            nvram.read_int("DPM_SERVER_ADDR"),
            Err(NvramError::Parse(_))
        ));
    }

    #[test]
    fn json_store_persists() {
        let path = std::env::temp_dir().join(format!("dpm-nvram-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let nvram = JsonNvram::open(&path);
        assert!(nvram.read_string("DPM_SERVER_PORT").is_none());
        nvram.write_int("DPM_SERVER_PORT", 7000).unwrap();
        nvram.write_string("DPM_NAME", "sensor").unwrap();

        let reopened = JsonNvram::open(&path);
        assert_eq!(reopened.read_int("DPM_SERVER_PORT").unwrap(), 7000);
        assert_eq!(reopened.read_string("DPM_NAME").as_deref(), Some("sensor"));

        fs::write(&path, b"{ not json").unwrap();
        assert!(JsonNvram::open(&path).read_string("DPM_NAME").is_none());
        let _ = fs::remove_file(&path);
    }
}
