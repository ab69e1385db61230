//! Probe configuration: the identity to log in as and how to reach the server.

use std::fmt;
use std::time::Duration;

use crate::error::ProbeError;

/// Default overall deadline for one probe run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bare XMPP address split into local part and domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jid {
    local: String,
    domain: String,
}

impl Jid {
    /// Parse `user@server.tld`. Exactly one `@` with non-empty parts on both sides.
    pub fn parse(input: &str) -> Result<Self, ProbeError> {
        let trimmed = input.trim();
        let mut parts = trimmed.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
                Ok(Self {
                    local: local.to_string(),
                    domain: domain.to_string(),
                })
            }
            _ => Err(ProbeError::InvalidJid(input.to_string())),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Password held in memory only. `Debug` never prints it.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Everything one probe run needs. Built once from the command line.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub jid: Jid,
    pub password: Secret,
    pub timeout: Duration,
    /// Explicit endpoint (`host`, `host:port`, `tcp://host:port`); skips SRV.
    pub server: Option<String>,
    /// Skip certificate verification during the STARTTLS upgrade.
    pub insecure_tls: bool,
}

impl ProbeConfig {
    pub fn new(jid: Jid, password: Secret) -> Self {
        Self {
            jid,
            password,
            timeout: DEFAULT_TIMEOUT,
            server: None,
            insecure_tls: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }
}

/// Parse a duration flag: `5s`, `1500ms`, `2m`, or bare seconds (`5`, `0.5`).
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let (number, to_secs): (&str, fn(f64) -> f64) =
        if let Some(n) = trimmed.strip_suffix("ms") {
            (n, |v| v / 1000.0)
        } else if let Some(n) = trimmed.strip_suffix('s') {
            (n, |v| v)
        } else if let Some(n) = trimmed.strip_suffix('m') {
            (n, |v| v * 60.0)
        } else {
            (trimmed, |v| v)
        };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{}' (expected e.g. 5s, 1500ms)", input))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("duration must be positive, got '{}'", input));
    }
    Duration::try_from_secs_f64(to_secs(value))
        .map_err(|e| format!("invalid duration '{}': {}", input, e))
}
