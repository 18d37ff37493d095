//! Storage module for the address database

pub mod addr_db;

pub use addr_db::{
    bytes_to_i32, i32_to_bytes, AddrDb, JsonFileDb, MemoryDb, StoreError, ADDR_DB_FILE,
};
