//! The provisioning protocol server.
//!
//! One accept loop, one connection in flight at a time, handled
//! synchronously to completion. Each request is: read the name packet
//! under a short receive timeout, validate it byte-by-byte, confirm the
//! name exists in the directory, provision the database role, and reply
//! with exactly one status byte before an orderly socket shutdown.
//!
//! Nothing that goes wrong inside one request can affect the next: every
//! failure is mapped to a status byte (or silently dropped when the client
//! is already gone) and the connection's resources are scoped to the loop
//! iteration. Shutdown is cooperative; the loop observes the shutdown
//! channel at its accept boundary and never gets preempted mid-request.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::NetSettings;
use crate::daemon::protocol::{self, Decoded, MAX_NAME_BYTES, Status};
use crate::error::Result;
use crate::services::directory::{Directory, Lookup};
use crate::services::provision::Provisioner;

/// What one read pass produced.
enum ReadOutcome {
    /// A complete, validated account name.
    Name(String),
    /// The client closed before sending a terminated name; no reply.
    Closed,
    /// The request is rejected with this status.
    Reject(Status),
}

pub struct Server<D, P> {
    directory: D,
    provisioner: P,
    net: NetSettings,
    shutdown: watch::Receiver<bool>,
}

impl<D, P> Server<D, P>
where
    D: Directory + Send + Sync,
    P: Provisioner + Send + Sync,
{
    pub fn new(
        directory: D,
        provisioner: P,
        net: NetSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            directory,
            provisioner,
            net,
            shutdown,
        }
    }

    /// Run the accept loop until shutdown is signalled. An accept failure
    /// is fatal to the loop and is returned to the supervisor.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let accepted = tokio::select! {
                _ = self.shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };

            let (mut stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    return Err(err.into());
                }
            };

            if *self.shutdown.borrow() {
                // raced with shutdown: tell the client and stop serving
                self.reply(&mut stream, Status::ShuttingDown, peer).await;
                let _ = stream.shutdown().await;
                break;
            }

            self.handle(stream, peer).await;
        }

        tracing::info!("connection handler stopped");
        Ok(())
    }

    /// Handle one connection to completion.
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        // linger briefly so the status byte survives the close
        if let Err(err) = stream.set_linger(Some(self.net.linger())) {
            tracing::debug!(%peer, %err, "failed to set linger");
        }

        let reply = match self.read_name(&mut stream).await {
            ReadOutcome::Closed => {
                tracing::debug!(%peer, "client closed before sending a name");
                None
            }
            ReadOutcome::Reject(status) => Some(status),
            ReadOutcome::Name(name) => Some(self.provision_account(&name).await),
        };

        if let Some(status) = reply {
            self.reply(&mut stream, status, peer).await;
        }

        let _ = stream.shutdown().await;
        // discard whatever the client still has in flight, so closing the
        // socket does not turn the status byte into a reset
        self.drain(&mut stream).await;
    }

    async fn drain(&self, stream: &mut TcpStream) {
        let mut scratch = [0u8; 64];
        loop {
            match timeout(self.net.recv_timeout(), stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => {}
            }
        }
    }

    /// Read and validate the name packet.
    async fn read_name(&self, stream: &mut TcpStream) -> ReadOutcome {
        // one extra byte so an oversized packet is observable
        let mut buf = [0u8; MAX_NAME_BYTES + 1];
        let mut filled = 0usize;

        loop {
            let read = match timeout(self.net.recv_timeout(), stream.read(&mut buf[filled..])).await
            {
                Err(_) => return ReadOutcome::Reject(Status::TimedOut),
                Ok(Err(err)) => {
                    tracing::debug!(%err, "recv failed");
                    return ReadOutcome::Reject(Status::ReadFailed);
                }
                Ok(Ok(0)) => return ReadOutcome::Closed,
                Ok(Ok(read)) => read,
            };
            filled += read;

            match protocol::decode_name(&buf[..filled]) {
                Decoded::Name(name) => return ReadOutcome::Name(name),
                Decoded::Reject(status) => return ReadOutcome::Reject(status),
                Decoded::NeedMore => {}
            }
        }
    }

    /// Look the name up in the directory and, when it exists, provision it.
    async fn provision_account(&self, name: &str) -> Status {
        match self.directory.exists(name).await {
            Err(err) => {
                tracing::warn!(name, %err, "directory lookup failed");
                Status::DirectoryUnreachable
            }
            // absent names are answered exactly like malformed ones so the
            // protocol does not reveal which names exist upstream
            Ok(Lookup::NotFound) => {
                tracing::info!(name, "account not present in the directory");
                Status::InvalidName
            }
            Ok(Lookup::Found) => match self.provisioner.grant(name).await {
                Err(err) if err.is_unreachable() => {
                    tracing::warn!(name, %err, "database unreachable");
                    Status::DatabaseUnreachable
                }
                Err(err) => {
                    tracing::warn!(name, %err, "provisioning failed");
                    Status::SqlFailure
                }
                Ok(()) => {
                    tracing::info!(name, "account provisioned");
                    Status::Ok
                }
            },
        }
    }

    /// Send the single status byte. Failures are logged and swallowed; the
    /// client may already be gone and the next request must not care.
    async fn reply(&self, stream: &mut TcpStream, status: Status, peer: SocketAddr) {
        match timeout(
            self.net.send_timeout(),
            stream.write_all(&[status.as_byte()]),
        )
        .await
        {
            Err(_) => tracing::warn!(%peer, %status, "status reply timed out"),
            Ok(Err(err)) => tracing::warn!(%peer, %status, %err, "status reply failed"),
            Ok(Ok(())) => tracing::debug!(%peer, %status, "request complete"),
        }
    }
}
