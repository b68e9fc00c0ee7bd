//! BITS packet types and protocol constants

/// Upload protocol GUID the server speaks, as matched in
/// `BITS-Supported-Protocols` (case-insensitive).
pub const PROTOCOL_GUID: &str = "7df0354d-249b-430f-820d-3d2a9bef4931";

/// The protocol GUID as returned in `BITS-Protocol`.
pub const PROTOCOL_GUID_BRACED: &str = "{7df0354d-249b-430f-820d-3d2a9bef4931}";

/// `E_INVALIDARG`, reported in `BITS-Error-Code` for rejected requests.
pub const E_INVALIDARG: &str = "0x80070057";

/// Server-side error context, reported in `BITS-Error-Context`.
pub const CONTEXT_SERVER: &str = "0x7";

/// BITS packet types, discriminated by the `BITS-Packet-Type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    CreateSession,
    Ping,
    Fragment,
    CloseSession,
    CancelSession,
}

impl PacketType {
    /// Parse the case-folded `BITS-Packet-Type` header value.
    pub fn parse(header: Option<&str>) -> Option<Self> {
        match header?.trim().to_ascii_lowercase().as_str() {
            "create-session" => Some(PacketType::CreateSession),
            "ping" => Some(PacketType::Ping),
            "fragment" => Some(PacketType::Fragment),
            "close-session" => Some(PacketType::CloseSession),
            "cancel-session" => Some(PacketType::CancelSession),
            _ => None,
        }
    }

    /// True for the packet types that never carry a request body
    pub fn forbids_content(self) -> bool {
        !matches!(self, PacketType::Fragment)
    }
}

/// Does a `BITS-Supported-Protocols` header offer the protocol we speak?
///
/// The header may carry one GUID or a separated list; matching is
/// case-insensitive and positional (any occurrence anywhere qualifies).
pub fn protocols_match(header: Option<&str>) -> bool {
    match header {
        Some(value) => value.to_ascii_lowercase().contains(PROTOCOL_GUID),
        None => false,
    }
}
