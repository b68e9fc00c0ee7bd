//! # vdigate BITS
//!
//! Server side of Microsoft's Background Intelligent Transfer Service
//! upload protocol, layered over the VHD and raw import pipelines:
//! packet-type dispatch, per-upload session state with a monotonic write
//! cursor, fragment contiguity enforcement, and the
//! `BITS-Received-Content-Range` accounting that makes uploads resumable.

pub mod fragment;
pub mod packet;
pub mod session;

pub use fragment::{apply_fragment, FragmentOutcome};
pub use packet::PacketType;
pub use session::{Session, SessionRegistry, Sink};
