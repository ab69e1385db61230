//! Scripted fake XMPP server and pass-through upgrader for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{BoxedIo, Upgrade, XmppEndpoint};
use crate::config::{Jid, ProbeConfig, Secret};
use crate::error::ProbeError;

/// Written by `PassthroughUpgrader` so the server transcript shows where the
/// upgrade happened.
pub const TLS_MARKER: &str = "<!--tls-->";

pub const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.org' \
    version='1.0' xml:lang='en'>";

pub const FEATURES_STARTTLS: &str = "<stream:features>\
    <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
    </stream:features>";

pub const FEATURES_SASL: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms>\
    </stream:features>";

pub const FEATURES_BIND: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
    <session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>\
    </stream:features>";

pub const PROCEED: &str = "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
pub const SASL_SUCCESS: &str = "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>";
pub const SASL_FAILURE: &str =
    "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>";

const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Skips the handshake; counts calls and marks the wire.
#[derive(Debug, Default)]
pub struct PassthroughUpgrader {
    calls: AtomicUsize,
}

impl PassthroughUpgrader {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Upgrade for PassthroughUpgrader {
    async fn upgrade(&self, mut io: BoxedIo, _domain: &str) -> Result<BoxedIo, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        io.write_all(TLS_MARKER.as_bytes()).await?;
        Ok(io)
    }
}

pub async fn listener() -> (TcpListener, XmppEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server listener");
    let port = listener.local_addr().expect("fake server addr").port();
    (
        listener,
        XmppEndpoint {
            host: "127.0.0.1".to_string(),
            port,
        },
    )
}

pub fn alice() -> Jid {
    Jid::parse("alice@example.org").unwrap()
}

pub fn config(endpoint: &XmppEndpoint) -> ProbeConfig {
    ProbeConfig::new(alice(), Secret::new("secret")).with_server(endpoint.address())
}

/// Server side of one client connection, recording everything received.
pub struct FakeServer {
    socket: TcpStream,
    pub transcript: String,
}

impl FakeServer {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.expect("accept client");
        Self {
            socket,
            transcript: String::new(),
        }
    }

    /// Read until `needle` has been received `count` times in total.
    pub async fn wait_for(&mut self, needle: &str, count: usize) {
        let mut buf = [0u8; 4096];
        while self.transcript.matches(needle).count() < count {
            let n = tokio::time::timeout(SERVER_READ_TIMEOUT, self.socket.read(&mut buf))
                .await
                .unwrap_or_else(|_| {
                    panic!("timed out waiting for {:?}; got: {}", needle, self.transcript)
                })
                .expect("fake server read");
            assert!(
                n > 0,
                "client hung up while waiting for {:?}; got: {}",
                needle,
                self.transcript
            );
            self.transcript.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.socket
            .write_all(xml.as_bytes())
            .await
            .expect("fake server write");
    }

    /// Read until the client closes the connection; return the full transcript.
    pub async fn drain(mut self) -> String {
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(SERVER_READ_TIMEOUT, self.socket.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return self.transcript,
                Ok(Ok(n)) => self
                    .transcript
                    .push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
    }
}

/// How the fake server answers `<auth/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    Success,
    Failure,
}

/// Play the server side of the handshake. On success, returns once the
/// client's presence has arrived; on failure, right after `<failure/>`.
pub async fn serve_handshake(server: &mut FakeServer, auth: AuthReply) {
    server.wait_for("<stream:stream", 1).await;
    server.send(&format!("{}{}", SERVER_HEADER, FEATURES_STARTTLS)).await;

    server.wait_for("<starttls", 1).await;
    server.send(PROCEED).await;

    server.wait_for("<stream:stream", 2).await;
    server.send(&format!("{}{}", SERVER_HEADER, FEATURES_SASL)).await;

    server.wait_for("</auth>", 1).await;
    if auth == AuthReply::Failure {
        server.send(SASL_FAILURE).await;
        return;
    }
    server.send(SASL_SUCCESS).await;

    server.wait_for("<stream:stream", 3).await;
    server.send(&format!("{}{}", SERVER_HEADER, FEATURES_BIND)).await;

    server.wait_for("</presence>", 1).await;
}
