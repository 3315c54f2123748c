//! Wire-protocol client for the provisioning service.
//!
//! Used by the `rolegate provision` command and by integration tests. The
//! request is the account name padded with zero bytes to the full packet
//! size, which is what the service expects; the reply is a single status
//! byte.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::daemon::protocol::{MAX_NAME_BYTES, REPLY_BYTES, Status};
use crate::error::{Result, RolegateError};

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProvisionClient {
    addr: String,
    io_timeout: Duration,
}

impl ProvisionClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Ask the service to provision `name` and return the decoded status.
    pub async fn provision(&self, name: &str) -> Result<Status> {
        let packet = build_packet(name)?;

        let mut stream = timeout(self.io_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RolegateError::Connect {
                addr: self.addr.clone(),
                source: std::io::ErrorKind::TimedOut.into(),
            })?
            .map_err(|source| RolegateError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        timeout(self.io_timeout, stream.write_all(&packet))
            .await
            .map_err(|_| RolegateError::Protocol("request send timed out".into()))??;

        let mut reply = [0u8; REPLY_BYTES];
        timeout(self.io_timeout, stream.read_exact(&mut reply))
            .await
            .map_err(|_| RolegateError::Protocol("no reply from the service".into()))??;

        Status::from_byte(reply[0]).ok_or_else(|| {
            RolegateError::Protocol(format!("unknown status byte 0x{:02x}", reply[0]))
        })
    }
}

/// The service expects a packet of exactly [`MAX_NAME_BYTES`] bytes, with
/// short names padded by zero bytes.
fn build_packet(name: &str) -> Result<[u8; MAX_NAME_BYTES]> {
    if name.is_empty() || name.len() > MAX_NAME_BYTES {
        return Err(RolegateError::InvalidName {
            field: "account name",
            value: name.to_string(),
            reason: "must be between 1 and 63 bytes",
        });
    }

    let mut packet = [0u8; MAX_NAME_BYTES];
    packet[..name.len()].copy_from_slice(name.as_bytes());
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_zero_padded_to_full_size() {
        let packet = build_packet("example").unwrap();
        assert_eq!(&packet[..7], b"example");
        assert!(packet[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn full_length_names_fill_the_packet() {
        let name = "a".repeat(MAX_NAME_BYTES);
        let packet = build_packet(&name).unwrap();
        assert_eq!(&packet[..], name.as_bytes());
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(build_packet("").is_err());
        assert!(build_packet(&"a".repeat(MAX_NAME_BYTES + 1)).is_err());
    }
}
