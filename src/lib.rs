// src/lib.rs

pub mod binding;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod interaction;
pub mod log_entry;
pub mod metrics;
pub mod process_stream;
pub mod replay;
pub mod serde_helpers;
pub mod sql_analysis;
pub mod tsv_export;
pub mod type_resolver;

pub use error::{ReplayError, Result};
