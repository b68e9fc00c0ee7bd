//! # vdigate web
//!
//! The HTTP face of the virtual-disk gateway: an axum router that serves
//! synthesized VHD downloads (GET/HEAD), raw and VHD uploads (PUT), and
//! resumable BITS uploads (the custom BITS_POST method), all driven by a
//! per-path JSON configuration.

pub mod config;
pub mod handlers;

pub use config::{ExportSettings, GatewayConfig, PathConfig};
pub use handlers::{app, AppState};
