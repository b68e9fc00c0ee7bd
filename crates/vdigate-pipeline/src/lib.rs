//! # vdigate pipeline
//!
//! Byte plumbing between HTTP request bodies and raw block devices:
//! - [`ChunkQueue`], a cursor-advancing consumer over a rope of in-memory
//!   buffers
//! - positioned writes, size probes, and zero sweeps against backing
//!   files and block devices

pub mod blockio;
pub mod queue;

pub use queue::{ChunkQueue, Fill};
