//! Configuration for postrider
//!
//! A single immutable [`Config`] is loaded at startup; nothing is re-read
//! mid-run. Secrets may be supplied through the environment instead of the
//! file (`SMTP_PASSWORD`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Outbound SMTP server configuration
    pub smtp: SmtpConfig,

    /// Sender identity
    pub sender: SenderConfig,

    /// Delivery/retry configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Pre-send check configuration
    #[serde(default)]
    pub checks: ChecksConfig,

    /// DKIM signing configuration; absent disables signing
    pub dkim: Option<DkimConfig>,

    /// Message template configuration
    pub template: TemplateConfig,

    /// Recipient roster configuration
    #[serde(default)]
    pub roster: RosterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Outbound SMTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Server hostname
    pub host: String,

    /// Server port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Authentication username
    pub username: String,

    /// Authentication password; overridable via `SMTP_PASSWORD`
    #[serde(default)]
    pub password: String,

    /// Upgrade the connection with STARTTLS after EHLO
    #[serde(default = "default_true")]
    pub starttls: bool,

    /// Connect/command timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Sender identity and compliance addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Envelope and From address
    pub address: String,

    /// Display name for the From header
    pub name: Option<String>,

    /// Reply-To address when different from the sender
    pub reply_to: Option<String>,

    /// Mailbox that receives unsubscribe requests
    pub unsubscribe_address: Option<String>,

    /// Base URL for one-click unsubscribe links
    pub unsubscribe_url: Option<String>,
}

impl SenderConfig {
    /// Domain part of the sender address, used for Message-ID and DNS checks.
    pub fn domain(&self) -> Option<&str> {
        self.address.split('@').nth(1).filter(|d| !d.is_empty())
    }
}

/// Delivery/retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum transmission attempts per recipient
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in seconds
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Cap on the retry delay in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter fraction applied to retry delays (0.25 = ±25%)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Recipients per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches in seconds
    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,

    /// Short pacing delay between sends inside a batch, in milliseconds
    #[serde(default = "default_per_message_delay_ms")]
    pub per_message_delay_ms: u64,

    /// Concurrent delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum concurrently open SMTP connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Sends after which a connection is retired and reopened
    #[serde(default = "default_rotate_after")]
    pub rotate_after_sends: u32,

    /// Include the HTML alternative when a template provides one
    #[serde(default = "default_true")]
    pub html_enabled: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter_fraction: default_jitter_fraction(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
            per_message_delay_ms: default_per_message_delay_ms(),
            workers: default_workers(),
            pool_size: default_pool_size(),
            rotate_after_sends: default_rotate_after(),
            html_enabled: default_true(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    10
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_secs() -> u64 {
    5
}

fn default_per_message_delay_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    4
}

fn default_pool_size() -> usize {
    2
}

fn default_rotate_after() -> u32 {
    50
}

/// Pre-send check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Master switch for the pre-send validation gate
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run SPF/DMARC presence lookups for the sending domain
    #[serde(default = "default_true")]
    pub dns_enabled: bool,

    /// Outbound IP to query against blocklists; absent skips the DNSBL check
    pub sender_ip: Option<String>,

    /// Blocklist zones queried with the reversed sender IP
    #[serde(default = "default_dnsbl_zones")]
    pub dnsbl_zones: Vec<String>,

    /// Abort a recipient on any failed check (warnings never abort)
    #[serde(default = "default_true")]
    pub reject_on_failure: bool,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dns_enabled: default_true(),
            sender_ip: None,
            dnsbl_zones: default_dnsbl_zones(),
            reject_on_failure: default_true(),
        }
    }
}

fn default_dnsbl_zones() -> Vec<String> {
    vec![
        "zen.spamhaus.org".to_string(),
        "bl.spamcop.net".to_string(),
        "b.barracudacentral.org".to_string(),
        "dnsbl.sorbs.net".to_string(),
    ]
}

/// DKIM signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Signing domain (d= tag)
    pub domain: String,

    /// Selector (s= tag)
    #[serde(default = "default_dkim_selector")]
    pub selector: String,

    /// Path to the PKCS#8 PEM private key
    pub private_key_path: PathBuf,
}

fn default_dkim_selector() -> String {
    "default".to_string()
}

/// Message template configuration
///
/// The subject is short enough to live inline; bodies may be inline or in
/// sibling files. Placeholders: `{{var1}}`..`{{var3}}`, `{{email}}`,
/// `{{sender_name}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Subject template
    pub subject: String,

    /// Inline plain-text body template
    pub body: Option<String>,

    /// Plain-text body template file; used when `body` is absent
    pub body_file: Option<PathBuf>,

    /// Optional HTML body template file
    pub html_file: Option<PathBuf>,
}

impl TemplateConfig {
    /// Resolve the body and optional HTML templates to strings.
    pub fn load(&self) -> crate::Result<(String, Option<String>)> {
        let body = match (&self.body, &self.body_file) {
            (Some(body), _) => body.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                crate::Error::Config(format!("failed to read template.body_file {:?}: {}", path, e))
            })?,
            (None, None) => {
                return Err(crate::Error::Config(
                    "template.body or template.body_file must be set".to_string(),
                ))
            }
        };
        let html = match &self.html_file {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                crate::Error::Config(format!("failed to read template.html_file {:?}: {}", path, e))
            })?),
            None => None,
        };
        Ok((body, html))
    }
}

/// Recipient roster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Path to the roster CSV
    #[serde(default = "default_roster_path")]
    pub path: PathBuf,

    /// Directory holding attachment files referenced by roster rows
    #[serde(default = "default_attachments_dir")]
    pub attachments_dir: PathBuf,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            path: default_roster_path(),
            attachments_dir: default_attachments_dir(),
        }
    }
}

fn default_roster_path() -> PathBuf {
    PathBuf::from("roster.csv")
}

fn default_attachments_dir() -> PathBuf {
    PathBuf::from("attachments")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, overridable via `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        if let Ok(password) = std::env::var("SMTP_PASSWORD") {
            config.smtp.password = password;
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup validation; failures here abort the run before any send.
    pub fn validate(&self) -> crate::Result<()> {
        if self.smtp.host.is_empty() {
            return Err(crate::Error::Config("smtp.host must be set".to_string()));
        }
        if self.smtp.username.is_empty() || self.smtp.password.is_empty() {
            return Err(crate::Error::Config(
                "smtp.username and smtp.password (or SMTP_PASSWORD) must be set".to_string(),
            ));
        }
        if self.sender.domain().is_none() {
            return Err(crate::Error::Config(format!(
                "sender.address '{}' is not a valid address",
                self.sender.address
            )));
        }
        if self.delivery.max_attempts == 0 {
            return Err(crate::Error::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.pool_size == 0 || self.delivery.workers == 0 {
            return Err(crate::Error::Config(
                "delivery.pool_size and delivery.workers must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.delivery.jitter_fraction) {
            return Err(crate::Error::Config(
                "delivery.jitter_fraction must be in [0, 1)".to_string(),
            ));
        }
        if self.template.subject.is_empty() {
            return Err(crate::Error::Config(
                "template.subject must be set".to_string(),
            ));
        }
        if self.template.body.is_none() && self.template.body_file.is_none() {
            return Err(crate::Error::Config(
                "template.body or template.body_file must be set".to_string(),
            ));
        }
        if let Some(dkim) = &self.dkim {
            if dkim.domain.is_empty() || dkim.selector.is_empty() {
                return Err(crate::Error::Config(
                    "dkim.domain and dkim.selector must be set when dkim is configured".to_string(),
                ));
            }
        }
        Ok(())
    }
}
