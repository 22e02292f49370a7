// src/backend/storage/mod.rs
// Encrypted on-disk persistence: one sealed file per record, write-once audit entries.

pub mod audit_logs;
pub mod files;
pub mod records;
pub mod storable;
pub mod vault;

pub use records::RecordKey;
pub use storable::Cbor;
pub use vault::Vault;
