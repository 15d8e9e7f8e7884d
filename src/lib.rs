//! Log collector
//!
//! Scans configured locations for log files, filters their lines into events
//! and optionally packages the selected files into an archive or a folder.

pub mod api;
pub mod collect;
pub mod error;
pub mod fs;
pub mod storage;
pub mod utils;
pub mod web;
