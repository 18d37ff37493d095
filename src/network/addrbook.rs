//! Address book
//!
//! Persistent, deduplicated set of candidate peer addresses plus the node's
//! own addresses (used to avoid dialing ourselves), the node identity and
//! the external-port hint left by the last successful NAT mapping.

use crate::crypto::NodeKey;
use crate::network::netaddr::NetAddress;
use crate::storage::{bytes_to_i32, i32_to_bytes, AddrDb, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// =============================================================================
// Constants
// =============================================================================

/// Database key of the last successfully mapped external port
pub const EXTERNAL_PORT_TAG: &[u8] = b"externalPortTag";

/// Database key of the serialized address set
const ADDR_BOOK_TAG: &[u8] = b"addrBook";

/// Database key of the node private key
const NODE_KEY_TAG: &[u8] = b"nodePrivKey";

/// Consecutive failed attempts after which an address is considered bad
pub const MAX_FAILED_ATTEMPTS: u32 = 5;

// =============================================================================
// Known Address
// =============================================================================

/// Address entry with connection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownAddress {
    pub addr: NetAddress,
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Unix seconds
    pub last_attempt: Option<i64>,
    /// Unix seconds
    pub last_success: Option<i64>,
}

impl KnownAddress {
    pub fn new(addr: NetAddress) -> Self {
        Self {
            addr,
            attempts: 0,
            last_attempt: None,
            last_success: None,
        }
    }

    /// Too many failures in a row
    pub fn is_bad(&self) -> bool {
        self.attempts >= MAX_FAILED_ATTEMPTS
    }

    pub fn mark_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_good(&mut self) {
        let now = chrono::Utc::now().timestamp();
        self.attempts = 0;
        self.last_attempt = Some(now);
        self.last_success = Some(now);
    }
}

#[derive(Default)]
struct BookState {
    addrs: HashMap<String, KnownAddress>,
    our_addrs: HashSet<String>,
}

// =============================================================================
// Address Book
// =============================================================================

pub struct AddrBook {
    db: Arc<dyn AddrDb>,
    state: Mutex<BookState>,
    key: NodeKey,
    closed: AtomicBool,
}

impl AddrBook {
    /// Load the book from `db`, creating the node key on first use
    pub fn open(db: Arc<dyn AddrDb>) -> Result<Self, StoreError> {
        let key = match db.get(NODE_KEY_TAG)? {
            Some(bytes) => {
                let hex_key = String::from_utf8(bytes)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                NodeKey::from_private_key_hex(&hex_key)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?
            }
            None => {
                let key = NodeKey::generate();
                db.set(NODE_KEY_TAG, key.private_key_hex().as_bytes())?;
                log::info!("Generated node key {}", key.public_key_hex());
                key
            }
        };

        let mut state = BookState::default();
        if let Some(bytes) = db.get(ADDR_BOOK_TAG)? {
            let known: Vec<KnownAddress> = serde_json::from_slice(&bytes)?;
            for entry in known {
                state.addrs.insert(entry.addr.to_string(), entry);
            }
            log::info!("Loaded {} addresses from address book", state.addrs.len());
        }

        Ok(Self {
            db,
            state: Mutex::new(state),
            key,
            closed: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn size(&self) -> usize {
        self.state().addrs.len()
    }

    /// Add a candidate address. Returns `true` only when it was new.
    /// Our own addresses are never stored.
    pub fn add_address(&self, addr: NetAddress) -> bool {
        if self.is_closed() {
            return false;
        }
        let key = addr.to_string();
        let mut state = self.state();
        if state.our_addrs.contains(&key) || state.addrs.contains_key(&key) {
            return false;
        }
        log::debug!("AddrBook add {}", key);
        state.addrs.insert(key, KnownAddress::new(addr));
        true
    }

    pub fn remove_addr(&self, addr: &str) {
        if self.state().addrs.remove(addr).is_some() {
            log::debug!("AddrBook remove {}", addr);
        }
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.state().addrs.contains_key(addr)
    }

    pub fn get_addrs(&self) -> Vec<String> {
        self.state().addrs.keys().cloned().collect()
    }

    pub fn get_known(&self, addr: &str) -> Option<KnownAddress> {
        self.state().addrs.get(addr).cloned()
    }

    /// Record the outcome of a dial or heartbeat; returns the updated entry
    pub fn set_addr_stat(&self, addr: &str, success: bool) -> Option<KnownAddress> {
        let mut state = self.state();
        let entry = state.addrs.get_mut(addr)?;
        if success {
            entry.mark_good();
        } else {
            entry.mark_attempt();
        }
        Some(entry.clone())
    }

    /// Remember one of our own addresses; it is dropped from the candidates
    pub fn add_our_address(&self, addr: NetAddress) {
        let key = addr.to_string();
        let mut state = self.state();
        state.addrs.remove(&key);
        if state.our_addrs.insert(key.clone()) {
            log::debug!("AddrBook add our address {}", key);
        }
    }

    pub fn is_our_address(&self, addr: &str) -> bool {
        self.state().our_addrs.contains(addr)
    }

    /// `(private key hex, public key hex)`
    pub fn get_priv_pub_key(&self) -> (String, String) {
        (self.key.private_key_hex(), self.key.public_key_hex())
    }

    pub fn node_name(&self) -> String {
        self.key.public_key_hex()
    }

    pub fn db_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get(key)
    }

    pub fn db_set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.set(key, value)
    }

    /// Port persisted by the last successful NAT mapping
    pub fn external_port(&self) -> Option<u16> {
        match self.db_get(EXTERNAL_PORT_TAG) {
            Ok(Some(bytes)) => bytes_to_i32(&bytes).and_then(|p| u16::try_from(p).ok()),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to read external port: {}", e);
                None
            }
        }
    }

    pub fn set_external_port(&self, port: u16) -> Result<(), StoreError> {
        self.db_set(EXTERNAL_PORT_TAG, &i32_to_bytes(i32::from(port)))
    }

    /// Write the address set to the database
    pub fn save(&self) -> Result<(), StoreError> {
        let known: Vec<KnownAddress> = self.state().addrs.values().cloned().collect();
        let bytes = serde_json::to_vec(&known)?;
        self.db.set(ADDR_BOOK_TAG, &bytes)?;
        log::debug!("Saved {} addresses", known.len());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Persist and stop accepting new addresses
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.save().and_then(|_| self.db.flush()) {
            log::error!("Failed to save address book: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JsonFileDb, MemoryDb};

    fn addr(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    fn book() -> AddrBook {
        AddrBook::open(Arc::new(MemoryDb::new())).unwrap()
    }

    #[test]
    fn test_add_address_deduplicates() {
        let book = book();
        assert!(book.add_address(addr("8.8.8.8:13802")));
        assert!(!book.add_address(addr("8.8.8.8:13802")));
        assert_eq!(book.size(), 1);

        book.remove_addr("8.8.8.8:13802");
        assert_eq!(book.size(), 0);
        assert!(book.add_address(addr("8.8.8.8:13802")));
    }

    #[test]
    fn test_our_address_never_stored() {
        let book = book();
        book.add_address(addr("1.2.3.4:13802"));
        book.add_our_address(addr("1.2.3.4:13802"));

        assert!(book.is_our_address("1.2.3.4:13802"));
        assert!(!book.contains("1.2.3.4:13802"));
        assert!(!book.add_address(addr("1.2.3.4:13802")));
    }

    #[test]
    fn test_addr_stat_marks_bad() {
        let book = book();
        book.add_address(addr("8.8.8.8:13802"));

        for _ in 0..MAX_FAILED_ATTEMPTS {
            book.set_addr_stat("8.8.8.8:13802", false);
        }
        assert!(book.get_known("8.8.8.8:13802").unwrap().is_bad());

        let entry = book.set_addr_stat("8.8.8.8:13802", true).unwrap();
        assert!(!entry.is_bad());
        assert!(entry.last_success.is_some());
        assert!(book.set_addr_stat("9.9.9.9:1", true).is_none());
    }

    #[test]
    fn test_external_port_roundtrip() {
        let book = book();
        assert_eq!(book.external_port(), None);
        book.set_external_port(40000).unwrap();
        assert_eq!(book.external_port(), Some(40000));
    }

    #[test]
    fn test_db_passthrough() {
        let book = book();
        assert_eq!(book.db_get(b"custom").unwrap(), None);
        book.db_set(b"custom", b"value").unwrap();
        assert_eq!(book.db_get(b"custom").unwrap(), Some(b"value".to_vec()));

        // the port tag lives in the same store
        book.set_external_port(40000).unwrap();
        assert!(book.db_get(EXTERNAL_PORT_TAG).unwrap().is_some());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();

        let db = Arc::new(JsonFileDb::open(temp_dir.path()).unwrap());
        let book = AddrBook::open(db).unwrap();
        book.add_address(addr("8.8.8.8:13802"));
        let (_, pub_key) = book.get_priv_pub_key();
        book.close();
        assert!(!book.add_address(addr("9.9.9.9:13802")));

        let db = Arc::new(JsonFileDb::open(temp_dir.path()).unwrap());
        let book = AddrBook::open(db).unwrap();
        assert!(book.contains("8.8.8.8:13802"));
        assert_eq!(book.get_priv_pub_key().1, pub_key);
    }
}
