// src/backend/lib.rs
//! Afterself core: a dead man's switch that watches for check-ins, escalates to
//! trusted contacts, and runs a pre-declared action plan once absence is confirmed.

pub mod api;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use api::Afterself;
pub use error::{AfterselfError, Result};
