pub mod action;
pub mod audit_log;
pub mod common;
pub mod config;
pub mod contact;
pub mod state;

// Re-export common types/enums for easier access
pub use common::*;
