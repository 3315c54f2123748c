//! End-to-end tests for the provisioning protocol server.
//!
//! The server runs in-process on an ephemeral port with stubbed directory
//! and provisioner backends; clients talk to it over real TCP sockets so
//! the framing, timeouts, and status bytes are exercised on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use rolegate::config::NetSettings;
use rolegate::daemon::client::ProvisionClient;
use rolegate::daemon::protocol::{MAX_NAME_BYTES, Status};
use rolegate::daemon::server::Server;
use rolegate::services::directory::{Directory, DirectoryError, Lookup};
use rolegate::services::provision::{ProvisionError, Provisioner};

#[derive(Clone, Default)]
struct StubDirectory {
    known: Vec<String>,
    unreachable: bool,
    calls: Arc<AtomicUsize>,
}

impl StubDirectory {
    fn knowing(names: &[&str]) -> Self {
        Self {
            known: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Directory for StubDirectory {
    async fn exists(&self, name: &str) -> Result<Lookup, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(DirectoryError::TimedOut(Duration::from_millis(200)));
        }
        if self.known.iter().any(|known| known == name) {
            Ok(Lookup::Found)
        } else {
            Ok(Lookup::NotFound)
        }
    }
}

#[derive(Clone, Copy)]
enum GrantBehavior {
    Succeed,
    Unreachable,
    RejectStatement,
}

#[derive(Clone)]
struct StubProvisioner {
    behavior: GrantBehavior,
    granted: Arc<Mutex<Vec<String>>>,
}

impl StubProvisioner {
    fn new(behavior: GrantBehavior) -> Self {
        Self {
            behavior,
            granted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn granted(&self) -> Vec<String> {
        self.granted.lock().await.clone()
    }
}

impl Provisioner for StubProvisioner {
    async fn grant(&self, name: &str) -> Result<(), ProvisionError> {
        match self.behavior {
            GrantBehavior::Succeed => {
                self.granted.lock().await.push(name.to_string());
                Ok(())
            }
            GrantBehavior::Unreachable => {
                Err(ProvisionError::ConnectTimedOut(Duration::from_secs(2)))
            }
            GrantBehavior::RejectStatement => {
                Err(ProvisionError::Statement(sqlx::Error::RowNotFound))
            }
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<rolegate::Result<()>>,
}

async fn start_server(directory: StubDirectory, provisioner: StubProvisioner) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);

    let server = Server::new(directory, provisioner, NetSettings::default(), shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    TestServer {
        addr,
        shutdown,
        handle,
    }
}

impl TestServer {
    fn client(&self) -> ProvisionClient {
        ProvisionClient::new("127.0.0.1", self.addr.port()).with_timeout(Duration::from_secs(2))
    }

    /// Send raw bytes and return the raw reply, if any.
    async fn send_raw(&self, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        timeout(Duration::from_secs(2), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn provisions_a_known_account() {
    let directory = StubDirectory::knowing(&["alice-01"]);
    let provisioner = StubProvisioner::new(GrantBehavior::Succeed);
    let server = start_server(directory.clone(), provisioner.clone()).await;

    let status = server.client().provision("alice-01").await.unwrap();

    assert_eq!(status, Status::Ok);
    assert_eq!(directory.calls(), 1);
    assert_eq!(provisioner.granted().await, vec!["alice-01".to_string()]);
    server.stop().await;
}

#[tokio::test]
async fn bad_name_is_rejected_before_any_upstream_call() {
    let directory = StubDirectory::knowing(&["bad!name"]);
    let provisioner = StubProvisioner::new(GrantBehavior::Succeed);
    let server = start_server(directory.clone(), provisioner.clone()).await;

    let status = server.client().provision("bad!name").await.unwrap();

    assert_eq!(status, Status::InvalidName);
    assert_eq!(directory.calls(), 0);
    assert!(provisioner.granted().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn absent_name_is_answered_like_an_invalid_one() {
    let directory = StubDirectory::knowing(&[]);
    let provisioner = StubProvisioner::new(GrantBehavior::Succeed);
    let server = start_server(directory.clone(), provisioner.clone()).await;

    let status = server.client().provision("ghost").await.unwrap();

    // deliberately indistinguishable from a malformed name on the wire
    assert_eq!(status, Status::InvalidName);
    assert_eq!(directory.calls(), 1);
    assert!(provisioner.granted().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn directory_failure_maps_to_unreachable() {
    let server = start_server(
        StubDirectory::unreachable(),
        StubProvisioner::new(GrantBehavior::Succeed),
    )
    .await;

    let status = server.client().provision("alice-01").await.unwrap();

    assert_eq!(status, Status::DirectoryUnreachable);
    server.stop().await;
}

#[tokio::test]
async fn database_failures_keep_their_two_codes() {
    let server = start_server(
        StubDirectory::knowing(&["alice-01"]),
        StubProvisioner::new(GrantBehavior::Unreachable),
    )
    .await;
    let status = server.client().provision("alice-01").await.unwrap();
    assert_eq!(status, Status::DatabaseUnreachable);
    server.stop().await;

    let server = start_server(
        StubDirectory::knowing(&["alice-01"]),
        StubProvisioner::new(GrantBehavior::RejectStatement),
    )
    .await;
    let status = server.client().provision("alice-01").await.unwrap();
    assert_eq!(status, Status::SqlFailure);
    server.stop().await;
}

#[tokio::test]
async fn oversized_packet_is_malformed() {
    let directory = StubDirectory::knowing(&[]);
    let server = start_server(
        directory.clone(),
        StubProvisioner::new(GrantBehavior::Succeed),
    )
    .await;

    let reply = server.send_raw(&[b'a'; MAX_NAME_BYTES + 7]).await;

    assert_eq!(reply, [Status::MalformedPacket.as_byte()]);
    assert_eq!(directory.calls(), 0);
    server.stop().await;
}

#[tokio::test]
async fn boundary_terminates_a_full_length_name() {
    let name = "a".repeat(MAX_NAME_BYTES);
    let directory = StubDirectory::knowing(&[name.as_str()]);
    let provisioner = StubProvisioner::new(GrantBehavior::Succeed);
    let server = start_server(directory.clone(), provisioner.clone()).await;

    let reply = server.send_raw(name.as_bytes()).await;

    assert_eq!(reply, [Status::Ok.as_byte()]);
    assert_eq!(provisioner.granted().await, vec![name]);
    server.stop().await;
}

#[tokio::test]
async fn orderly_close_before_a_name_gets_no_reply() {
    let directory = StubDirectory::knowing(&["ali"]);
    let server = start_server(
        directory.clone(),
        StubProvisioner::new(GrantBehavior::Succeed),
    )
    .await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"ali").await.unwrap();
    // half-close without a terminator: the name never completed
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();

    assert!(reply.is_empty());
    assert_eq!(directory.calls(), 0);
    server.stop().await;
}

#[tokio::test]
async fn silent_client_times_out() {
    let server = start_server(
        StubDirectory::knowing(&[]),
        StubProvisioner::new(GrantBehavior::Succeed),
    )
    .await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    // send an unterminated fragment and then go quiet
    stream.write_all(b"ali").await.unwrap();
    sleep(Duration::from_millis(400)).await;

    let mut reply = [0u8; 1];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply[0], Status::TimedOut.as_byte());
    server.stop().await;
}

#[tokio::test]
async fn a_failed_request_does_not_poison_the_next() {
    let directory = StubDirectory::knowing(&["alice-01"]);
    let provisioner = StubProvisioner::new(GrantBehavior::Succeed);
    let server = start_server(directory.clone(), provisioner.clone()).await;

    let client = server.client();
    assert_eq!(
        client.provision("bad!name").await.unwrap(),
        Status::InvalidName
    );
    assert_eq!(client.provision("ghost").await.unwrap(), Status::InvalidName);
    assert_eq!(client.provision("alice-01").await.unwrap(), Status::Ok);

    assert_eq!(provisioner.granted().await, vec!["alice-01".to_string()]);
    server.stop().await;
}

#[tokio::test]
async fn shutdown_stops_the_accept_loop() {
    let server = start_server(
        StubDirectory::knowing(&[]),
        StubProvisioner::new(GrantBehavior::Succeed),
    )
    .await;
    let addr = server.addr;

    server.stop().await;

    // the listener is gone once the handler returns
    let refused = TcpStream::connect(addr).await;
    assert!(refused.is_err());
}
