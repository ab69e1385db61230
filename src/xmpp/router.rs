//! Inbound stanza routing for an online session.
//!
//! Reads top-level stanzas until the stream ends or the probe is done.
//! `jabber:client` messages are decoded and handed to the delivery channel,
//! one at a time: a full channel blocks the router. Everything else is
//! skipped without decoding.

use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::scanner::Scanner;
use super::stanza::MessageStanza;
use super::{NS_CLIENT, NS_STREAMS};
use crate::error::ProbeError;

pub struct Router<R> {
    scanner: Scanner<R>,
    deliveries: mpsc::Sender<MessageStanza>,
    cancel: CancellationToken,
}

impl<R: AsyncBufRead + Unpin> Router<R> {
    /// The scanner must be bound to the final (post-auth) stream.
    pub fn new(
        scanner: Scanner<R>,
        deliveries: mpsc::Sender<MessageStanza>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scanner,
            deliveries,
            cancel,
        }
    }

    /// Route until cancelled (`Ok`), the consumer goes away (`Ok`), or the
    /// stream fails (`Err`). Stream errors are never recovered.
    pub async fn run(mut self) -> Result<(), ProbeError> {
        let cancel = self.cancel.clone();
        loop {
            let keep_going = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Router cancelled");
                    return Ok(());
                }
                step = self.route_next() => step?,
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Route one stanza. `Ok(false)` once nobody listens for messages.
    async fn route_next(&mut self) -> Result<bool, ProbeError> {
        let tag = self.scanner.next_start().await?;

        if tag.is(NS_CLIENT, "message") {
            let inner = self.scanner.read_inner(&tag).await?;
            match MessageStanza::decode(&tag, inner) {
                Ok(message) => {
                    debug!(from = %message.from, id = %message.id, kind = %message.kind,
                        "Received message");
                    if self.deliveries.send(message).await.is_err() {
                        debug!("Delivery channel closed");
                        return Ok(false);
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "Failed to parse incoming <message> stanza")
                }
                Err(e) => return Err(e),
            }
        } else if tag.is(NS_STREAMS, "error") {
            return Err(self.scanner.read_stream_error(&tag).await);
        } else {
            trace!(element = %tag.qualified_name(), "Skipping stanza");
            self.scanner.skip(&tag).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<MessageStanza>) -> Vec<MessageStanza> {
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_forwards_only_client_messages() {
        let input = concat!(
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            "<iq type='result' id='bind1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>",
            "<jid>alice@example.org/res</jid></bind></iq>",
            "<presence from='alice@example.org/res'><show>online</show></presence>",
            "<message xmlns='urn:example:other' from='x@example.org'><body>no</body></message>",
            "<message from='alice@example.org/res' id='m1'><body>Check</body></message>",
            "<presence/>",
            "<message from='bob@example.org' id='m2' type='chat'/>",
        );
        let mut scanner = Scanner::new(input.as_bytes());
        scanner.next_start().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let router = Router::new(scanner, tx, CancellationToken::new());

        let routing = tokio::spawn(router.run());
        let delivered = collect(rx).await;

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].from, "alice@example.org/res");
        assert_eq!(delivered[0].id, "m1");
        assert_eq!(delivered[0].inner_xml, b"<body>Check</body>");
        assert_eq!(delivered[1].from, "bob@example.org");
        assert_eq!(delivered[1].kind, "chat");

        // Input exhausted: the stream is gone.
        let result = routing.await.unwrap();
        assert!(matches!(result, Err(ProbeError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped_and_routing_continues() {
        let input = concat!(
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            "<message to='alice@example.org'><body>no sender</body></message>",
            "<message from='a&unknown;b'/>",
            "<message from='alice@example.org/res'/>",
        );
        let mut scanner = Scanner::new(input.as_bytes());
        scanner.next_start().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let routing = tokio::spawn(Router::new(scanner, tx, CancellationToken::new()).run());

        let delivered = collect(rx).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].from, "alice@example.org/res");
        assert!(matches!(
            routing.await.unwrap(),
            Err(ProbeError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_stream_error_is_fatal() {
        let input = concat!(
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            "<stream:error><system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>",
            "</stream:error>",
        );
        let mut scanner = Scanner::new(input.as_bytes());
        scanner.next_start().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let result = Router::new(scanner, tx, CancellationToken::new()).run().await;
        match result {
            Err(ProbeError::StreamError(condition)) => assert_eq!(condition, "system-shutdown"),
            other => panic!("expected StreamError, got {:?}", other),
        }
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_router() {
        let (client, _server) = tokio::io::duplex(1024);
        let scanner = Scanner::new(tokio::io::BufReader::new(client));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let routing = tokio::spawn(Router::new(scanner, tx, cancel.clone()).run());

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), routing)
            .await
            .expect("router should stop promptly after cancel")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_router_stops_when_consumer_is_gone() {
        let input = concat!(
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            "<message from='alice@example.org/res'/>",
            "<message from='alice@example.org/res'/>",
        );
        let mut scanner = Scanner::new(input.as_bytes());
        scanner.next_start().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = Router::new(scanner, tx, CancellationToken::new()).run().await;
        assert!(result.is_ok());
    }
}
