//! Address database persistence layer
//!
//! A small key-value store backing the address book: the known address set,
//! the node key and the last mapped external port all live here.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// File name of the address database inside the data directory
pub const ADDR_DB_FILE: &str = "addrbook.json";

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Key-value store used by the address book
pub trait AddrDb: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    /// Make every previous `set` durable
    fn flush(&self) -> Result<(), StoreError>;
}

/// JSON file store. Keys and values are hex-encoded on disk.
pub struct JsonFileDb {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl JsonFileDb {
    /// Open (or create) the database file in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(ADDR_DB_FILE);

        let data = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), data)?;

        // Atomic rename
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.data
            .lock()
            .map_err(|_| StoreError::InvalidData("address db lock poisoned".to_string()))
    }
}

impl AddrDb for JsonFileDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.lock()?;
        match data.get(&hex::encode(key)) {
            Some(value) => hex::decode(value)
                .map(Some)
                .map_err(|e| StoreError::InvalidData(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut data = self.lock()?;
        data.insert(hex::encode(key), hex::encode(value));
        self.write(&data)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let data = self.lock()?;
        self.write(&data)
    }
}

/// In-memory store, nothing survives the process
#[derive(Default)]
pub struct MemoryDb {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddrDb for MemoryDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .data
            .lock()
            .map_err(|_| StoreError::InvalidData("memory db lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StoreError::InvalidData("memory db lock poisoned".to_string()))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Encode a port (or any i32) the way it is persisted: 4 bytes big-endian
pub fn i32_to_bytes(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decode a persisted i32; `None` unless exactly 4 bytes
pub fn bytes_to_i32(bytes: &[u8]) -> Option<i32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(i32::from_be_bytes(arr))
}
