//! Pull scanner over the inbound XMPP stream.
//!
//! Wraps a namespace-aware `quick_xml` reader and exposes only what the
//! negotiator and router need: the next start tag, and a way to consume the
//! rest of an element (discarding it, or capturing its inner XML). Text, end
//! tags, comments and declarations between start tags are dropped.
//!
//! The stream root `<stream:stream>` is never closed while the session is
//! alive, so every stanza shows up as a child of it. Its end tag, or EOF on
//! the transport, ends the scan with `StreamClosed`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::{NsReader, Writer};
use tokio::io::AsyncBufRead;

use super::NS_STREAMS;
use crate::error::ProbeError;

/// An open tag as seen on the wire, with its resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag {
    namespace: Option<String>,
    local: String,
    /// Raw (escaped) attribute values, `xmlns` declarations excluded.
    attributes: Vec<(String, Vec<u8>)>,
    /// Self-closing: there is no subtree left to consume.
    empty: bool,
}

impl StartTag {
    fn from_event(ns: ResolveResult, e: &BytesStart, empty: bool) -> Result<Self, ProbeError> {
        let namespace = match ns {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
            ResolveResult::Unbound => None,
            ResolveResult::Unknown(prefix) => {
                return Err(ProbeError::MalformedStream(format!(
                    "undeclared namespace prefix '{}'",
                    String::from_utf8_lossy(&prefix)
                )))
            }
        };
        let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| ProbeError::MalformedStream(err.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            attributes.push((key, attr.value.into_owned()));
        }

        Ok(Self {
            namespace,
            local,
            attributes,
            empty,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Match on qualified name (namespace + local name).
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local == local
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Qualified name in `{namespace}local` notation, for logs.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{{{}}}{}", ns, self.local),
            None => self.local.clone(),
        }
    }

    /// Unescaped attribute value. `InvalidStanza` if it is not valid UTF-8 or
    /// contains a bad entity reference.
    pub fn attr(&self, key: &str) -> Result<Option<String>, ProbeError> {
        let Some((_, raw)) = self.attributes.iter().find(|(k, _)| k == key) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(raw).map_err(|e| {
            ProbeError::InvalidStanza(format!("attribute '{}' is not UTF-8: {}", key, e))
        })?;
        let value = quick_xml::escape::unescape(text).map_err(|e| {
            ProbeError::InvalidStanza(format!("attribute '{}': {}", key, e))
        })?;
        Ok(Some(value.into_owned()))
    }
}

/// Forward-only scanner bound to one stream.
///
/// A fresh scanner is created for every stream restart (after STARTTLS and
/// after authentication); the old one must not be read from again.
pub struct Scanner<R> {
    reader: NsReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> Scanner<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: NsReader::from_reader(inner),
            buf: Vec::new(),
        }
    }

    /// Next open tag at any depth, skipping every other token.
    pub async fn next_start(&mut self) -> Result<StartTag, ProbeError> {
        loop {
            self.buf.clear();
            let (ns, event) = self
                .reader
                .read_resolved_event_into_async(&mut self.buf)
                .await?;
            match event {
                Event::Start(e) => return StartTag::from_event(ns, &e, false),
                Event::Empty(e) => return StartTag::from_event(ns, &e, true),
                Event::End(e) => {
                    let in_streams_ns = matches!(
                        ns,
                        ResolveResult::Bound(n) if n.as_ref() == NS_STREAMS.as_bytes()
                    );
                    let closes_stream = in_streams_ns && e.local_name().as_ref() == b"stream";
                    if closes_stream {
                        return Err(ProbeError::StreamClosed);
                    }
                }
                Event::Eof => return Err(ProbeError::StreamClosed),
                _ => {}
            }
        }
    }

    /// Consume and discard the rest of `tag`'s subtree.
    ///
    /// Must be called right after `next_start` returned `tag`.
    pub async fn skip(&mut self, tag: &StartTag) -> Result<(), ProbeError> {
        if tag.empty {
            return Ok(());
        }
        self.consume_subtree(None).await
    }

    /// Consume the rest of `tag`'s subtree and return its inner XML verbatim
    /// (children and text, without the closing tag).
    ///
    /// Must be called right after `next_start` returned `tag`.
    pub async fn read_inner(&mut self, tag: &StartTag) -> Result<Vec<u8>, ProbeError> {
        if tag.empty {
            return Ok(Vec::new());
        }
        let mut writer = Writer::new(Vec::new());
        self.consume_subtree(Some(&mut writer)).await?;
        Ok(writer.into_inner())
    }

    async fn consume_subtree(
        &mut self,
        mut sink: Option<&mut Writer<Vec<u8>>>,
    ) -> Result<(), ProbeError> {
        let mut depth = 0usize;
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into_async(&mut self.buf).await?;
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) if depth == 0 => return Ok(()),
                Event::End(_) => depth -= 1,
                Event::Eof => return Err(ProbeError::StreamClosed),
                _ => {}
            }
            if let Some(writer) = sink.as_mut() {
                writer
                    .write_event(event)
                    .map_err(|e| ProbeError::MalformedStream(e.to_string()))?;
            }
        }
    }

    /// Turn a `<stream:error>` just returned by `next_start` into an error
    /// carrying its defined condition (the first child element).
    pub async fn read_stream_error(&mut self, tag: &StartTag) -> ProbeError {
        if tag.empty {
            return ProbeError::StreamError("undefined-condition".to_string());
        }
        match self.next_start().await {
            Ok(condition) => ProbeError::StreamError(condition.local_name().to_string()),
            Err(e) => e,
        }
    }

    /// Release the underlying reader, including any bytes it has buffered.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}
