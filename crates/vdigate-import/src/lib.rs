//! # vdigate import
//!
//! Streaming upload paths into raw backing devices:
//! - [`VhdImport`], a single-pass state machine that parses an inbound
//!   sparse VHD stream and writes its data blocks to their virtual offsets,
//!   with an optional sparse mode that honors per-block sector bitmaps
//! - [`raw`], positioned whole-file and `Content-Range` writes with no VHD
//!   awareness

pub mod raw;
pub mod vhd;

pub use vhd::{Progress, VhdImport, WriteMode};
