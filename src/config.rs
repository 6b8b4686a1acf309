//! Configuration module for the mail store account and engine settings
//!
//! All configuration is loaded from environment variables under the
//! `DUTYMAIL_` prefix. There is a single account (the shared departmental
//! mailbox); the mailbox roster for global search, the special-purpose
//! mailbox names, and all pool/fan-out knobs live here.

use std::env;
use std::env::VarError;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{EngineError, EngineResult};

/// Behavior of `acquire` when the pool has reached `max_connections`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Block until another caller releases a connection
    Wait,
    /// Fail immediately with `EngineError::PoolExhausted`
    FailFast,
}

/// Engine configuration
///
/// Holds mail store connection details, credentials, per-call timeouts,
/// pool capacity, and the mailbox roster. Passwords are stored using
/// `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mail store hostname
    pub host: String,
    /// Mail store port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Greeting/TLS handshake/login timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-call socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Pool capacity; `None` lets the pool grow without bound
    pub max_connections: Option<usize>,
    /// What `acquire` does when the pool is at capacity
    pub exhaustion_policy: ExhaustionPolicy,
    /// Seconds between keep-alive sweeps of idle pooled connections
    pub keepalive_secs: u64,
    /// Maximum concurrent per-mailbox workers during a global search
    pub fan_out_workers: usize,
    /// Mailbox roster searched when no mailbox is specified
    pub mailboxes: Vec<String>,
    /// The inbox, used for the unread-mail duty count
    pub inbox_mailbox: String,
    /// The outbound folder; its summaries show the recipient as sender
    pub sent_mailbox: String,
    /// The fixed mailbox holding voicemail messages
    pub voicemail_mailbox: String,
}

impl EngineConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// DUTYMAIL_HOST=mail.example.edu
    /// DUTYMAIL_USER=frontdesk@example.edu
    /// DUTYMAIL_PASS=app-password
    /// DUTYMAIL_MAILBOXES=INBOX,Archives,Junk Email
    /// DUTYMAIL_MAX_CONNECTIONS=40
    /// DUTYMAIL_POOL_EXHAUSTION=fail-fast
    /// ```
    pub fn load_from_env() -> EngineResult<Self> {
        let host = required_env("DUTYMAIL_HOST")?;
        let user = required_env("DUTYMAIL_USER")?;
        let pass = required_env("DUTYMAIL_PASS")?;

        Ok(Self {
            host,
            port: parse_u16_env("DUTYMAIL_PORT", 993)?,
            secure: parse_bool_env("DUTYMAIL_SECURE", true)?,
            user,
            pass: SecretString::new(pass.into()),
            connect_timeout_ms: parse_u64_env("DUTYMAIL_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env("DUTYMAIL_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_u64_env("DUTYMAIL_SOCKET_TIMEOUT_MS", 300_000)?,
            max_connections: parse_opt_usize_env("DUTYMAIL_MAX_CONNECTIONS")?,
            exhaustion_policy: parse_policy_env("DUTYMAIL_POOL_EXHAUSTION", ExhaustionPolicy::Wait)?,
            keepalive_secs: parse_u64_env("DUTYMAIL_KEEPALIVE_SECS", 60)?,
            fan_out_workers: parse_usize_env("DUTYMAIL_FANOUT_WORKERS", 20)?,
            mailboxes: parse_list_env("DUTYMAIL_MAILBOXES", &["INBOX"]),
            inbox_mailbox: env_or("DUTYMAIL_INBOX", "INBOX"),
            sent_mailbox: env_or("DUTYMAIL_SENT_MAILBOX", "Sent Items"),
            voicemail_mailbox: env_or("DUTYMAIL_VOICEMAIL_MAILBOX", "Voicemails"),
        })
    }

    /// Socket I/O timeout as a `Duration`
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> EngineResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EngineError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable with a default fallback
fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_owned(),
    }
}

/// Parse a comma-separated mailbox list, falling back to `default` if unset
///
/// Entries are trimmed; empty entries are skipped so a trailing comma does
/// not produce a phantom mailbox.
fn parse_list_env(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => default.iter().map(|s| (*s).to_owned()).collect(),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> EngineResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            EngineError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse the pool exhaustion policy (`wait` or `fail-fast`)
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_policy_env(key: &str, default: ExhaustionPolicy) -> EngineResult<ExhaustionPolicy> {
    match env::var(key) {
        Ok(v) => parse_policy_value(&v).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "invalid pool policy environment variable {key}: '{v}' (expected 'wait' or 'fail-fast')"
            ))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_policy_value(value: &str) -> Option<ExhaustionPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "wait" | "block" => Some(ExhaustionPolicy::Wait),
        "fail-fast" | "fail_fast" | "fail" => Some(ExhaustionPolicy::FailFast),
        _ => None,
    }
}

/// Parse a `u16` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env(key: &str, default: u16) -> EngineResult<u16> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().map_err(|_| {
            EngineError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> EngineResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            EngineError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> EngineResult<usize> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            EngineError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse an optional `usize` environment variable
///
/// Returns `None` if unset (the pool then grows without bound).
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `usize`.
fn parse_opt_usize_env(key: &str) -> EngineResult<Option<usize>> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map(Some).map_err(|_| {
            EngineError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(EngineError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{ExhaustionPolicy, parse_bool_value, parse_policy_value};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn parse_policy_value_accepts_both_policies() {
        assert_eq!(parse_policy_value("wait"), Some(ExhaustionPolicy::Wait));
        assert_eq!(parse_policy_value("BLOCK"), Some(ExhaustionPolicy::Wait));
        assert_eq!(
            parse_policy_value("fail-fast"),
            Some(ExhaustionPolicy::FailFast)
        );
        assert_eq!(parse_policy_value("drop"), None);
    }
}
