//! # Packets
//!
//! Typed commands and responses exchanged with the firmware, and the
//! [`PacketBuilder`] contract that turns them into wire bytes and back.
//!
//! The payload encoding itself belongs to the platform. The core only
//! relies on the framing every packet shares: a little-endian `u32` total
//! size in bytes followed by a `u32` packet type. Firmware debug packets
//! are the one layout the core parses itself.

use alloc::vec::Vec;

use crate::config::UbwcConfig;
use crate::Result;

/// Bytes in the common `{size, packet_type}` header
pub const PACKET_HEADER_SIZE: usize = 8;

/// Packet type of a firmware debug line
pub const HFI_MSG_SYS_DEBUG: u32 = 0x0002_0004;

/// Bytes before the text of a debug packet
const DEBUG_HEADER_SIZE: usize = 24;

/// Shortest debug message worth printing (leading newline, a char, NUL)
const DEBUG_MIN_MSG_SIZE: usize = 3;

// =============================================================================
// COMMANDS
// =============================================================================

/// System cache slice advertised to the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubcacheEntry {
    /// Slice id
    pub slice_id: u32,
    /// Slice size in KiB
    pub size: u32,
}

/// Firmware crash to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SsrKind {
    /// Software fatal error
    SwErrorFatal = 1,
    /// Division by zero in the firmware
    SwDivByZero = 2,
    /// Hardware watchdog
    HwWatchdog = 3,
}

/// A command for the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfiCommand<'a> {
    /// Start the firmware protocol
    SysInit,
    /// Ask the firmware to report its image version
    SysImageVersion,
    /// Configure firmware debug output
    SysSetDebug {
        /// Message level mask
        level: u32,
        /// Output mode
        mode: u32,
    },
    /// Enable or disable idle reporting
    SysSetIdleIndicator(bool),
    /// Hand cache slices to the firmware
    SysSetResource(&'a [SubcacheEntry]),
    /// Take cache slices back
    SysReleaseResource(&'a [SubcacheEntry]),
    /// Bandwidth compression settings
    SysSetUbwcConfig(UbwcConfig),
    /// Prepare for power collapse
    SysPcPrep,
    /// Crash the firmware on purpose
    SysTestSsr(SsrKind),
    /// Open a session
    SessionInit {
        /// Wire session id
        session_id: u32,
        /// Session type
        session_type: u32,
    },
    /// Close a session gracefully
    SessionEnd {
        /// Wire session id
        session_id: u32,
    },
    /// Abort a session
    SessionAbort {
        /// Wire session id
        session_id: u32,
    },
    /// Flush in-flight work
    SessionFlush {
        /// Wire session id
        session_id: u32,
        /// Flush flags
        flags: u32,
    },
    /// Register a session buffer
    SessionSetBuffers {
        /// Wire session id
        session_id: u32,
        /// Device address
        iova: u32,
        /// Buffer size in bytes
        size: u32,
    },
    /// Drop the session buffers
    SessionReleaseBuffers {
        /// Wire session id
        session_id: u32,
    },
    /// Forward a caller-built payload
    SessionSend {
        /// Wire session id
        session_id: u32,
        /// Opaque packet body
        payload: &'a [u8],
    },
}

/// Discriminant of an [`HfiCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// See [`HfiCommand::SysInit`]
    SysInit,
    /// See [`HfiCommand::SysImageVersion`]
    SysImageVersion,
    /// See [`HfiCommand::SysSetDebug`]
    SysSetDebug,
    /// See [`HfiCommand::SysSetIdleIndicator`]
    SysSetIdleIndicator,
    /// See [`HfiCommand::SysSetResource`]
    SysSetResource,
    /// See [`HfiCommand::SysReleaseResource`]
    SysReleaseResource,
    /// See [`HfiCommand::SysSetUbwcConfig`]
    SysSetUbwcConfig,
    /// See [`HfiCommand::SysPcPrep`]
    SysPcPrep,
    /// See [`HfiCommand::SysTestSsr`]
    SysTestSsr,
    /// See [`HfiCommand::SessionInit`]
    SessionInit,
    /// See [`HfiCommand::SessionEnd`]
    SessionEnd,
    /// See [`HfiCommand::SessionAbort`]
    SessionAbort,
    /// See [`HfiCommand::SessionFlush`]
    SessionFlush,
    /// See [`HfiCommand::SessionSetBuffers`]
    SessionSetBuffers,
    /// See [`HfiCommand::SessionReleaseBuffers`]
    SessionReleaseBuffers,
    /// See [`HfiCommand::SessionSend`]
    SessionSend,
}

impl HfiCommand<'_> {
    /// Command discriminant
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SysInit => CommandKind::SysInit,
            Self::SysImageVersion => CommandKind::SysImageVersion,
            Self::SysSetDebug { .. } => CommandKind::SysSetDebug,
            Self::SysSetIdleIndicator(_) => CommandKind::SysSetIdleIndicator,
            Self::SysSetResource(_) => CommandKind::SysSetResource,
            Self::SysReleaseResource(_) => CommandKind::SysReleaseResource,
            Self::SysSetUbwcConfig(_) => CommandKind::SysSetUbwcConfig,
            Self::SysPcPrep => CommandKind::SysPcPrep,
            Self::SysTestSsr(_) => CommandKind::SysTestSsr,
            Self::SessionInit { .. } => CommandKind::SessionInit,
            Self::SessionEnd { .. } => CommandKind::SessionEnd,
            Self::SessionAbort { .. } => CommandKind::SessionAbort,
            Self::SessionFlush { .. } => CommandKind::SessionFlush,
            Self::SessionSetBuffers { .. } => CommandKind::SessionSetBuffers,
            Self::SessionReleaseBuffers { .. } => CommandKind::SessionReleaseBuffers,
            Self::SessionSend { .. } => CommandKind::SessionSend,
        }
    }

    /// Wire session id for session commands
    pub fn session_id(&self) -> Option<u32> {
        match *self {
            Self::SessionInit { session_id, .. }
            | Self::SessionEnd { session_id }
            | Self::SessionAbort { session_id }
            | Self::SessionFlush { session_id, .. }
            | Self::SessionSetBuffers { session_id, .. }
            | Self::SessionReleaseBuffers { session_id }
            | Self::SessionSend { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Typed firmware response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Protocol initialised
    SysInitDone,
    /// Ready for power collapse
    SysPcPrepDone,
    /// Cache slices returned
    SysReleaseResourceDone,
    /// Firmware went idle
    SysIdle,
    /// Property report
    SysPropertyInfo,
    /// Firmware hit a fatal error
    SysError,
    /// Session opened
    SessionInitDone,
    /// Session closed
    SessionEndDone,
    /// Session aborted
    SessionAbortDone,
    /// Flush complete
    SessionFlushDone,
    /// Buffers registered
    SessionSetBuffersDone,
    /// Buffers released
    SessionReleaseBuffersDone,
    /// Session-level error
    SessionError,
    /// Result of a forwarded payload
    SessionResult,
    /// Informational packet with nothing to deliver
    NoResponse,
}

impl ResponseKind {
    /// Whether the response is addressed to a session
    pub const fn carries_session(self) -> bool {
        matches!(
            self,
            Self::SessionInitDone
                | Self::SessionEndDone
                | Self::SessionAbortDone
                | Self::SessionFlushDone
                | Self::SessionSetBuffersDone
                | Self::SessionReleaseBuffersDone
                | Self::SessionError
                | Self::SessionResult
        )
    }
}

/// A decoded firmware packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfiResponse {
    /// Response type
    pub kind: ResponseKind,
    /// Wire session id, for session responses
    pub session_id: Option<u32>,
    /// Firmware status code, 0 on success
    pub status: u32,
    /// Raw packet, for the upper layer to interpret
    pub payload: Vec<u8>,
}

/// Packet encoder and decoder supplied by the platform
pub trait PacketBuilder: Send {
    /// Encode a command into a framed wire packet
    fn build(&self, command: &HfiCommand<'_>) -> Result<Vec<u8>>;

    /// Decode a raw message-queue packet
    fn decode(&self, raw: &[u8]) -> Result<HfiResponse>;
}

// =============================================================================
// FRAMING
// =============================================================================

fn le_word(raw: &[u8], offset: usize) -> Option<u32> {
    raw.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

/// Declared packet size (first word)
pub fn packet_size(raw: &[u8]) -> Option<u32> {
    le_word(raw, 0)
}

/// Packet type (second word)
pub fn packet_type(raw: &[u8]) -> Option<u32> {
    le_word(raw, 4)
}

/// What a debug-queue packet contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugRecord<'a> {
    /// A firmware log line
    Text(&'a str),
    /// Some other packet type
    Other(u32),
    /// Inconsistent sizes
    Malformed,
}

/// Parse one debug-queue packet
///
/// Firmware lines start with a newline which is dropped, and end at the
/// declared message size or the first NUL, whichever comes first.
pub fn parse_debug(raw: &[u8]) -> DebugRecord<'_> {
    let (Some(size), Some(ty)) = (packet_size(raw), packet_type(raw)) else {
        return DebugRecord::Malformed;
    };
    let size = size as usize;
    if size < PACKET_HEADER_SIZE || size > raw.len() {
        return DebugRecord::Malformed;
    }
    if ty != HFI_MSG_SYS_DEBUG {
        return DebugRecord::Other(ty);
    }
    if size < DEBUG_HEADER_SIZE {
        return DebugRecord::Malformed;
    }

    let Some(msg_size) = le_word(raw, 12).map(|s| s as usize) else {
        return DebugRecord::Malformed;
    };
    let data = &raw[DEBUG_HEADER_SIZE..size];
    if msg_size < DEBUG_MIN_MSG_SIZE || msg_size > data.len() {
        return DebugRecord::Malformed;
    }

    let text = &data[1..msg_size - 1];
    let text = match text.iter().position(|&b| b == 0) {
        Some(nul) => &text[..nul],
        None => text,
    };
    match core::str::from_utf8(text) {
        Ok(s) => DebugRecord::Text(s),
        Err(e) => DebugRecord::Text(core::str::from_utf8(&text[..e.valid_up_to()]).unwrap_or("")),
    }
}

/// Build a debug packet carrying `line`
///
/// The inverse of [`parse_debug`], used by firmware simulations.
pub fn encode_debug(line: &str) -> Vec<u8> {
    let msg_size = line.len() + 2;
    let size = (DEBUG_HEADER_SIZE + msg_size).next_multiple_of(4);
    let mut raw = Vec::with_capacity(size);
    raw.extend_from_slice(&(size as u32).to_le_bytes());
    raw.extend_from_slice(&HFI_MSG_SYS_DEBUG.to_le_bytes());
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&(msg_size as u32).to_le_bytes());
    raw.extend_from_slice(&[0u8; 8]);
    raw.push(b'\n');
    raw.extend_from_slice(line.as_bytes());
    raw.resize(size, 0);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_and_session() {
        let cmd = HfiCommand::SessionFlush {
            session_id: 7,
            flags: 1,
        };
        assert_eq!(cmd.kind(), CommandKind::SessionFlush);
        assert_eq!(cmd.session_id(), Some(7));
        assert_eq!(HfiCommand::SysPcPrep.session_id(), None);
    }

    #[test]
    fn test_session_responses() {
        assert!(ResponseKind::SessionResult.carries_session());
        assert!(!ResponseKind::SysError.carries_session());
        assert!(!ResponseKind::NoResponse.carries_session());
    }

    #[test]
    fn test_parse_debug_line() {
        let raw = encode_debug("fw: hello");
        assert_eq!(raw.len() % 4, 0);
        assert_eq!(parse_debug(&raw), DebugRecord::Text("fw: hello"));
    }

    #[test]
    fn test_parse_debug_rejects_bad_sizes() {
        let mut raw = encode_debug("x");
        raw[12..16].copy_from_slice(&200u32.to_le_bytes());
        assert_eq!(parse_debug(&raw), DebugRecord::Malformed);

        raw[12..16].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(parse_debug(&raw), DebugRecord::Malformed);

        assert_eq!(parse_debug(&[4, 0, 0, 0]), DebugRecord::Malformed);
    }

    #[test]
    fn test_parse_other_packet() {
        let mut raw = alloc::vec![0u8; 8];
        raw[0] = 8;
        raw[4] = 0x11;
        assert_eq!(parse_debug(&raw), DebugRecord::Other(0x11));
    }
}
