//! One end-to-end check: log in, message ourselves, wait for the echo.
//!
//! The whole run races a single deadline. Whichever finishes first decides
//! the outcome; the loser is dropped and the router task is cancelled, so no
//! task outlives the probe.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::status::Outcome;
use crate::xmpp::stanza::{self, random_label, LABEL_LEN};
use crate::xmpp::{
    parse_server_input, resolve_xmpp_server, ParsedServer, Router, Session, TlsUpgrader,
    Upgrade, XmppEndpoint,
};

pub const SUCCESS_MESSAGE: &str = "XMPP server is okay.";
pub const TIMEOUT_MESSAGE: &str = "Timeout";

const CHECK_BODY: &str = "Check";

/// Run the probe against the real server with TLS.
pub async fn run(config: &ProbeConfig) -> Outcome {
    let upgrader = TlsUpgrader::new(config.insecure_tls);
    run_with(config, &upgrader).await
}

pub async fn run_with<U: Upgrade>(config: &ProbeConfig, upgrader: &U) -> Outcome {
    let started = Instant::now();
    let cancel = CancellationToken::new();

    let outcome = tokio::select! {
        _ = tokio::time::sleep(config.timeout) => {
            warn!(timeout_ms = config.timeout.as_millis() as u64, "Deadline reached");
            Outcome::critical(TIMEOUT_MESSAGE)
        }
        result = check(config, upgrader, cancel.clone()) => match result {
            Ok(()) => Outcome::ok(SUCCESS_MESSAGE),
            Err(e) => {
                error!(error = %e, "Check failed");
                Outcome::from(e)
            }
        },
    };
    cancel.cancel();

    info!(
        status = outcome.status.label(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Probe finished"
    );
    outcome
}

async fn resolve_endpoint(config: &ProbeConfig) -> XmppEndpoint {
    match config.server.as_deref().map(parse_server_input) {
        Some(ParsedServer::Direct(host, port)) => {
            info!(host = %host, port, "Using explicit server");
            XmppEndpoint { host, port }
        }
        Some(ParsedServer::Domain(domain)) => resolve_xmpp_server(&domain).await,
        None => resolve_xmpp_server(config.jid.domain()).await,
    }
}

async fn check<U: Upgrade>(
    config: &ProbeConfig,
    upgrader: &U,
    cancel: CancellationToken,
) -> Result<(), ProbeError> {
    let endpoint = resolve_endpoint(config).await;
    let session = Session::establish(config, &endpoint, upgrader).await?;
    debug!(state = ?session.state(), "Session established");
    let (reader, mut writer) = session.into_parts();

    let (tx, mut rx) = mpsc::channel(1);
    let router = tokio::spawn(Router::new(reader, tx, cancel).run());

    let id = random_label(LABEL_LEN);
    info!(id = %id, "Sending message");
    writer
        .send(&stanza::message(&config.jid, &config.jid, &id, CHECK_BODY))
        .await?;

    info!("Waiting for message to arrive");
    while let Some(message) = rx.recv().await {
        if !message.is_from(&config.jid) {
            debug!(from = %message.from, "Ignoring message from another sender");
            continue;
        }
        if message.kind == "error" {
            warn!(from = %message.from, id = %message.id, "Echo came back as an error message");
        }
        info!(from = %message.from, id = %message.id, "Received message");
        return Ok(());
    }

    // The router hung up before the echo arrived.
    match router.await {
        Ok(Err(e)) => Err(e),
        Ok(Ok(())) => Err(ProbeError::StreamClosed),
        Err(e) => Err(ProbeError::RouterStopped(e.to_string())),
    }
}
