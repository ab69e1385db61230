//! Client session establishment.
//!
//! Drives the fixed RFC 6120 handshake over one TCP connection:
//!
//! 1. Open stream, read header and `<stream:features>` (not inspected)
//! 2. `<starttls/>`, read `<proceed/>`, upgrade the socket to TLS
//! 3. Reopen stream over TLS, read header and features
//! 4. SASL PLAIN `<auth/>`; `<failure/>` ends the session
//! 5. Reopen stream, read header and features
//! 6. Bind a random resource and send presence
//!
//! Each step blocks on the previous one. There is no retry and no alternative
//! mechanism. The bind result is not awaited: the router skips it like any
//! other non-message stanza.

use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::dns::XmppEndpoint;
use super::scanner::{Scanner, StartTag};
use super::stanza::{self, random_label, StanzaWriter, LABEL_LEN};
use super::tls::Upgrade;
use super::{BoxedIo, NS_STREAMS, NS_TLS};
use crate::config::{Jid, ProbeConfig, Secret};
use crate::error::ProbeError;

pub type SessionReader = Scanner<BufReader<ReadHalf<BoxedIo>>>;
pub type SessionWriter = StanzaWriter<WriteHalf<BoxedIo>>;

/// Which of the three streams of a session is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Plaintext,
    Secure,
    PostAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Disconnected,
    StreamOpened(StreamPhase),
    FeaturesSeen(StreamPhase),
    TlsNegotiating,
    Authenticating,
    Authenticated,
    ResourceBinding,
    Online,
    Failed,
}

/// One connection to the server with the scanner bound to its current stream.
///
/// The connection and scanner are replaced together on TLS upgrade; the
/// plaintext scanner is consumed in the process and cannot be reused.
pub struct Session {
    jid: Jid,
    scanner: SessionReader,
    writer: SessionWriter,
    state: NegotiationState,
}

impl Session {
    fn from_io(io: BoxedIo, jid: Jid, state: NegotiationState) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            jid,
            scanner: Scanner::new(BufReader::new(read_half)),
            writer: StanzaWriter::new(write_half),
            state,
        }
    }

    /// Connect to `endpoint` and run the whole handshake. Returns an `Online`
    /// session, or the first error.
    pub async fn establish<U: Upgrade>(
        config: &ProbeConfig,
        endpoint: &XmppEndpoint,
        upgrader: &U,
    ) -> Result<Session, ProbeError> {
        let addr = endpoint.address();
        info!(host = %endpoint.host, port = endpoint.port, "Connecting to XMPP host");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|source| ProbeError::Connect { addr, source })?;

        let mut session = Session::from_io(
            Box::new(tcp),
            config.jid.clone(),
            NegotiationState::Disconnected,
        );
        session.open_stream(StreamPhase::Plaintext).await?;
        session.request_tls().await?;

        let mut session = session.upgrade(upgrader).await?;
        session.open_stream(StreamPhase::Secure).await?;
        session.authenticate(&config.password).await?;

        let mut session = session.restart();
        session.open_stream(StreamPhase::PostAuth).await?;
        session.bind_resource().await?;
        session.announce_presence().await?;

        info!(jid = %session.jid, "XMPP stream is established");
        Ok(session)
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Hand the stream over: the reader goes to the router, the writer to
    /// whoever sends stanzas from now on.
    pub fn into_parts(self) -> (SessionReader, SessionWriter) {
        (self.scanner, self.writer)
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(from = ?self.state, to = ?next, "Negotiation state");
        self.state = next;
    }

    /// Next start tag, failing on `<stream:error/>`.
    async fn next_start(&mut self) -> Result<StartTag, ProbeError> {
        let tag = self.scanner.next_start().await?;
        if tag.is(NS_STREAMS, "error") {
            self.transition(NegotiationState::Failed);
            return Err(self.scanner.read_stream_error(&tag).await);
        }
        Ok(tag)
    }

    /// Send a stream header, then consume the server's header and skip its
    /// feature advertisement.
    async fn open_stream(&mut self, phase: StreamPhase) -> Result<(), ProbeError> {
        self.writer.send(&stanza::stream_open(&self.jid)).await?;

        let header = self.next_start().await?;
        if !header.is(NS_STREAMS, "stream") {
            warn!(element = %header.qualified_name(), "Expected stream header");
        }
        debug!(phase = ?phase, id = ?header.attr("id").ok().flatten(), "Server opened stream");
        self.transition(NegotiationState::StreamOpened(phase));

        let features = self.next_start().await?;
        debug!(phase = ?phase, element = %features.qualified_name(), "Skipping stream features");
        self.scanner.skip(&features).await?;
        self.transition(NegotiationState::FeaturesSeen(phase));
        Ok(())
    }

    async fn request_tls(&mut self) -> Result<(), ProbeError> {
        self.writer.send(&stanza::starttls()).await?;
        self.transition(NegotiationState::TlsNegotiating);

        let answer = self.next_start().await?;
        if !answer.is(NS_TLS, "proceed") {
            self.transition(NegotiationState::Failed);
            return Err(ProbeError::StartTlsRefused(answer.local_name().to_string()));
        }
        Ok(())
    }

    /// Swap the plaintext connection for a TLS one. Nothing may be left in
    /// the read buffer: bytes after `<proceed/>` belong to the handshake.
    async fn upgrade<U: Upgrade>(self, upgrader: &U) -> Result<Session, ProbeError> {
        let Session {
            jid,
            scanner,
            writer,
            state,
        } = self;

        let reader = scanner.into_inner();
        if !reader.buffer().is_empty() {
            return Err(ProbeError::PendingPlaintext(reader.buffer().len()));
        }
        let io = reader.into_inner().unsplit(writer.into_inner());

        info!(domain = jid.domain(), "Received <proceed/>, upgrading to TLS");
        let io = upgrader.upgrade(io, jid.domain()).await?;
        Ok(Session::from_io(io, jid, state))
    }

    async fn authenticate(&mut self, password: &Secret) -> Result<(), ProbeError> {
        self.writer
            .send_redacted(&stanza::auth_plain(&self.jid, password), "auth PLAIN")
            .await?;
        self.transition(NegotiationState::Authenticating);

        let answer = self.next_start().await?;
        if answer.local_name() == "failure" {
            self.transition(NegotiationState::Failed);
            warn!(jid = %self.jid, "Authentication failed");
            return Err(ProbeError::AuthFailed);
        }
        self.scanner.skip(&answer).await?;
        self.transition(NegotiationState::Authenticated);
        info!("Authentication successful");
        Ok(())
    }

    /// Bind a fresh scanner for the post-auth stream, keeping buffered bytes.
    fn restart(self) -> Session {
        let Session {
            jid,
            scanner,
            writer,
            state,
        } = self;
        Session {
            jid,
            scanner: Scanner::new(scanner.into_inner()),
            writer,
            state,
        }
    }

    async fn bind_resource(&mut self) -> Result<(), ProbeError> {
        let resource = random_label(LABEL_LEN);
        let id = random_label(LABEL_LEN);
        self.writer.send(&stanza::bind(&id, &resource)).await?;
        self.transition(NegotiationState::ResourceBinding);
        debug!(resource = %resource, id = %id, "Requested resource bind");
        Ok(())
    }

    async fn announce_presence(&mut self) -> Result<(), ProbeError> {
        self.writer.send(&stanza::presence()).await?;
        self.transition(NegotiationState::Online);
        Ok(())
    }
}
