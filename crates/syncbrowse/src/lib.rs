//! Folder browsing and sync-status coordination over a lazily cached index

pub mod browse;
pub mod cache;
pub mod cursor;
pub mod db;
pub mod devices;
pub mod engine;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod model;
pub mod ordering;
pub mod refresh;
pub mod settings;
pub mod source;
pub mod state;
pub mod transfer;
