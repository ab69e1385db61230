//! Stanzas the probe sends and the one it receives.

use base64::Engine as _;
use quick_xml::escape::escape;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::scanner::StartTag;
use super::{NS_BIND, NS_CLIENT, NS_SASL, NS_STREAMS, NS_TLS};
use crate::config::{Jid, Secret};
use crate::error::ProbeError;

/// Length of generated resource labels and stanza ids.
pub const LABEL_LEN: usize = 10;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random ASCII-letter string, unique enough for one session.
pub fn random_label(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Inbound `<message/>` in the `jabber:client` namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStanza {
    pub from: String,
    pub id: String,
    pub to: String,
    /// `type` attribute: `chat`, `error`, ... or empty.
    pub kind: String,
    /// Children and text, uninterpreted.
    pub inner_xml: Vec<u8>,
}

impl MessageStanza {
    /// Build from the start tag and the inner XML read after it. A missing
    /// `from` or an undecodable attribute makes the stanza invalid.
    pub fn decode(tag: &StartTag, inner_xml: Vec<u8>) -> Result<Self, ProbeError> {
        if !tag.is(NS_CLIENT, "message") {
            return Err(ProbeError::InvalidStanza(format!(
                "expected message, got {}",
                tag.qualified_name()
            )));
        }
        let from = tag
            .attr("from")?
            .ok_or_else(|| ProbeError::InvalidStanza("message without 'from'".to_string()))?;
        Ok(Self {
            from,
            id: tag.attr("id")?.unwrap_or_default(),
            to: tag.attr("to")?.unwrap_or_default(),
            kind: tag.attr("type")?.unwrap_or_default(),
            inner_xml,
        })
    }

    /// Whether the sender address contains `jid` (full JIDs carry a resource).
    pub fn is_from(&self, jid: &Jid) -> bool {
        self.from.contains(&jid.to_string())
    }
}

/// `<stream:stream>` header opening a client stream to `jid`'s domain.
pub fn stream_open(jid: &Jid) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream from='{}' to='{}' version='1.0' xml:lang='en' \
        xmlns='{}' xmlns:stream='{}'>",
        escape(&jid.to_string()),
        escape(jid.domain()),
        NS_CLIENT,
        NS_STREAMS
    )
}

pub fn starttls() -> String {
    format!("<starttls xmlns='{}'/>", NS_TLS)
}

/// SASL PLAIN payload: base64 of `\0user\0password`.
pub fn plain_credentials(user: &str, password: &Secret) -> String {
    let raw = format!("\0{}\0{}", user, password.expose());
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

/// SASL PLAIN `<auth/>`. Carries the secret; send it redacted.
pub fn auth_plain(jid: &Jid, password: &Secret) -> String {
    format!(
        "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
        NS_SASL,
        plain_credentials(jid.local(), password)
    )
}

pub fn bind(id: &str, resource: &str) -> String {
    format!(
        "<iq id='{}' type='set'><bind xmlns='{}'><resource>{}</resource></bind></iq>",
        escape(id),
        NS_BIND,
        escape(resource)
    )
}

pub fn presence() -> String {
    "<presence xml:lang='en'><show>online</show><status>Hey, I'm online.</status></presence>"
        .to_string()
}

pub fn message(from: &Jid, to: &Jid, id: &str, body: &str) -> String {
    format!(
        "<message from='{}' to='{}' id='{}'><body>{}</body></message>",
        escape(&from.to_string()),
        escape(&to.to_string()),
        escape(id),
        escape(body)
    )
}

/// Write side of the session. Raw traffic is logged at trace level
/// (`--debug=xmpp`), except stanzas sent through `send_redacted`.
pub struct StanzaWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StanzaWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, xml: &str) -> Result<(), ProbeError> {
        trace!(data = %xml, "C->S");
        self.write(xml).await
    }

    /// Send without logging the payload; only `label` is logged.
    pub async fn send_redacted(&mut self, xml: &str, label: &str) -> Result<(), ProbeError> {
        trace!(stanza = label, bytes = xml.len(), "C->S (redacted)");
        self.write(xml).await
    }

    async fn write(&mut self, xml: &str) -> Result<(), ProbeError> {
        self.inner.write_all(xml.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
