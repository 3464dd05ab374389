pub mod hex_bytes;
pub mod models;
pub mod storage;
pub mod traits;

pub use hex_bytes::Bytes;
