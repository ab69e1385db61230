//! Probe errors.
//!
//! Apart from `InvalidStanza`, which the router recovers from locally, every
//! variant ends the run with a CRITICAL status. There is no retry.

use quick_xml::errors::SyntaxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The configured user id is not of the form `user@server.tld`.
    #[error("Please specify fully qualified user ID such as 'user@server.tld'")]
    InvalidJid(String),

    /// TCP connect to the resolved endpoint failed.
    #[error("Failed to connect to XMPP server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write on an established connection failed.
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the stream (or the socket) before we were done.
    #[error("Stream closed by server")]
    StreamClosed,

    /// The byte stream is not well-formed XML.
    #[error("Malformed XML stream: {0}")]
    MalformedStream(String),

    /// The server sent `<stream:error/>`.
    #[error("Stream error from server: {0}")]
    StreamError(String),

    /// The server answered `<starttls/>` with something other than `<proceed/>`.
    #[error("Server refused STARTTLS: <{0}/>")]
    StartTlsRefused(String),

    #[error("TLS handshake with {host} failed: {reason}")]
    HandshakeFailed { host: String, reason: String },

    #[error("Authentication failed.")]
    AuthFailed,

    /// A single inbound stanza could not be decoded. Not fatal.
    #[error("Invalid stanza: {0}")]
    InvalidStanza(String),

    /// Plaintext bytes were still buffered when the TLS handshake was due.
    #[error("Unexpected data buffered before TLS upgrade ({0} bytes)")]
    PendingPlaintext(usize),

    /// The stanza router task ended without an error of its own.
    #[error("Stanza router stopped: {0}")]
    RouterStopped(String),
}

impl From<quick_xml::Error> for ProbeError {
    fn from(e: quick_xml::Error) -> Self {
        match e {
            quick_xml::Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                ProbeError::StreamClosed
            }
            // The input ended inside a tag, comment or CDATA: the peer hung up.
            quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedPIOrXmlDecl,
            ) => ProbeError::StreamClosed,
            quick_xml::Error::Io(io) => {
                ProbeError::Io(std::io::Error::new(io.kind(), io.to_string()))
            }
            other => ProbeError::MalformedStream(other.to_string()),
        }
    }
}

impl ProbeError {
    /// Whether the error ends the session. Only per-stanza decode errors are
    /// recoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProbeError::InvalidStanza(_))
    }
}
