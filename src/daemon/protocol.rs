//! Wire protocol for the provisioning service.
//!
//! ## Request
//!
//! A client connects over TCP and sends the candidate account name as raw
//! bytes: at most [`MAX_NAME_BYTES`] of them. There is no length prefix. A
//! zero byte terminates the name early and anything after it is ignored;
//! a name of exactly [`MAX_NAME_BYTES`] bytes needs no terminator because
//! the boundary itself ends the name.
//!
//! ## Response
//!
//! Exactly one [`Status`] byte per completed request, after which the
//! server performs an orderly shutdown of the connection. No other data
//! ever crosses back to the client.

use std::fmt;

/// Maximum number of name bytes in a request packet.
pub const MAX_NAME_BYTES: usize = 63;

/// Size of the reply, in bytes.
pub const REPLY_BYTES: usize = 1;

/// Single-byte result codes returned to the client.
///
/// The values are wire constants; clients decode all of them even though
/// the server does not currently send every one. `UnknownAccount` in
/// particular stays defined but unsent: absent directory names are
/// deliberately answered with `InvalidName` so the service does not reveal
/// which names exist upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// No problems detected.
    Ok = 0x00,
    /// Invalid account name: bad characters, empty, or not known upstream.
    InvalidName = 0x01,
    /// The directory server could not be reached or queried.
    DirectoryUnreachable = 0x02,
    /// Account name not found in the directory. Defined on the wire, never
    /// sent.
    UnknownAccount = 0x03,
    /// The database could not be reached.
    DatabaseUnreachable = 0x04,
    /// A provisioning statement was rejected by the database.
    SqlFailure = 0x05,
    /// Reading the request failed.
    ReadFailed = 0x06,
    /// Writing the reply failed.
    WriteFailed = 0x07,
    /// The received packet is invalid, such as wrong length.
    MalformedPacket = 0x08,
    /// The connection timed out while reading or writing.
    TimedOut = 0x09,
    /// The connection is being forced closed.
    ForcedClose = 0x0a,
    /// The connection is closing because the service is quitting.
    ShuttingDown = 0x0b,
}

impl Status {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::InvalidName),
            0x02 => Some(Status::DirectoryUnreachable),
            0x03 => Some(Status::UnknownAccount),
            0x04 => Some(Status::DatabaseUnreachable),
            0x05 => Some(Status::SqlFailure),
            0x06 => Some(Status::ReadFailed),
            0x07 => Some(Status::WriteFailed),
            0x08 => Some(Status::MalformedPacket),
            0x09 => Some(Status::TimedOut),
            0x0a => Some(Status::ForcedClose),
            0x0b => Some(Status::ShuttingDown),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Status::Ok => "account provisioned",
            Status::InvalidName => "invalid or unknown account name",
            Status::DirectoryUnreachable => "directory server unreachable",
            Status::UnknownAccount => "account not found in the directory",
            Status::DatabaseUnreachable => "database unreachable",
            Status::SqlFailure => "provisioning statement failed",
            Status::ReadFailed => "server failed to read the request",
            Status::WriteFailed => "server failed to write the reply",
            Status::MalformedPacket => "malformed request packet",
            Status::TimedOut => "connection timed out",
            Status::ForcedClose => "connection forced closed",
            Status::ShuttingDown => "service is shutting down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.describe(), self.as_byte())
    }
}

/// Progress of the incremental name decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, validated name.
    Name(String),
    /// The bytes so far are acceptable but the name is not terminated yet.
    NeedMore,
    /// The request is rejected; reply with this status and stop reading.
    Reject(Status),
}

/// True for the bytes allowed in an account name.
pub fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

/// Decode the bytes received so far into an account name.
///
/// Invalid bytes are rejected as soon as they are seen, without waiting
/// for the rest of the packet. More than [`MAX_NAME_BYTES`] bytes with no
/// terminator among the first [`MAX_NAME_BYTES`] rejects the packet as
/// malformed.
pub fn decode_name(buf: &[u8]) -> Decoded {
    // A zero byte within the name bytes terminates the name early; the
    // remainder of the packet is ignored.
    if let Some(pos) = buf.iter().take(MAX_NAME_BYTES).position(|&b| b == 0) {
        return finish(&buf[..pos]);
    }

    if buf.len() > MAX_NAME_BYTES {
        return Decoded::Reject(Status::MalformedPacket);
    }

    if let Some(&bad) = buf.iter().find(|&&b| !is_name_byte(b)) {
        tracing::debug!(byte = bad, "disallowed byte in account name");
        return Decoded::Reject(Status::InvalidName);
    }

    if buf.len() == MAX_NAME_BYTES {
        return finish(buf);
    }

    Decoded::NeedMore
}

fn finish(name: &[u8]) -> Decoded {
    if name.is_empty() || name.iter().any(|&b| !is_name_byte(b)) {
        return Decoded::Reject(Status::InvalidName);
    }
    match String::from_utf8(name.to_vec()) {
        Ok(name) => Decoded::Name(name),
        // unreachable for the allowed alphabet, but stay total
        Err(_) => Decoded::Reject(Status::InvalidName),
    }
}
