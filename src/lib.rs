//! LocalLab Library
//!
//! Local inference server: one resident GGUF model, buffered and streamed
//! generation, served over HTTP.

pub mod inference;
pub mod server;
pub mod storage;
pub mod system;
pub mod types;
