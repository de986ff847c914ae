//! remocr - remote OCR job processing server.
//!
//! Clients submit a PDF plus a block layout; jobs queue through a bounded
//! admission gate and execute on workers as a two-pass pipeline: render and
//! crop pages to disk, then dispatch the crops to external vision models
//! under rate limits, reconcile the returned block ids, retry the missing
//! ones, and publish Markdown/JSON/ZIP artifacts to an object store.

pub mod broker;
pub mod cli;
pub mod config;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod repository;
pub mod schema;
pub mod server;
pub mod storage;
pub mod utils;
pub mod worker;
