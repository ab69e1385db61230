mod dns;
mod router;
mod scanner;
mod session;
pub mod stanza;
mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use dns::{parse_server_input, resolve_xmpp_server, ParsedServer, XmppEndpoint};
pub use router::Router;
pub use session::Session;
pub use tls::{TlsUpgrader, Upgrade};

use tokio::io::{AsyncRead, AsyncWrite};

/// Standard XMPP client port (RFC 6120).
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Byte stream the session runs over: plain TCP before STARTTLS, TLS after.
pub trait XmppIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> XmppIo for T {}

pub type BoxedIo = Box<dyn XmppIo>;
