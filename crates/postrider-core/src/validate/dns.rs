//! Sender-side DNS checks
//!
//! SPF and DMARC presence for the sending domain, and DNSBL listing of the
//! outbound IP. These describe sender-side state, not recipient state, so
//! the verdict is computed once per run and shared by every worker.

use super::{CheckResult, CheckStatus};
use std::net::Ipv4Addr;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

/// Run-scoped DNS checker with a cached sender verdict.
pub struct DnsChecker {
    resolver: TokioAsyncResolver,
    sender_domain: String,
    sender_ip: Option<String>,
    dnsbl_zones: Vec<String>,
    cache: OnceCell<Vec<CheckResult>>,
}

impl DnsChecker {
    pub fn new(sender_domain: String, sender_ip: Option<String>, dnsbl_zones: Vec<String>) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            sender_domain,
            sender_ip,
            dnsbl_zones,
            cache: OnceCell::new(),
        }
    }

    /// Look for a TXT record with the given prefix at a name.
    async fn txt_record_with_prefix(&self, name: &str, prefix: &str) -> Result<Option<String>, ResolveError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                for record in lookup.iter() {
                    let txt = record
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>();
                    if txt.starts_with(prefix) {
                        return Ok(Some(txt));
                    }
                }
                Ok(None)
            }
            Err(e) if is_no_records(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn check_spf(&self) -> CheckStatus {
        match self.txt_record_with_prefix(&self.sender_domain, "v=spf1").await {
            Ok(Some(record)) => {
                debug!("SPF record found: {}", record);
                CheckStatus::Pass
            }
            Ok(None) => CheckStatus::Warning(format!(
                "no SPF record published for {}",
                self.sender_domain
            )),
            Err(e) => CheckStatus::Warning(format!("SPF lookup failed: {}", e)),
        }
    }

    async fn check_dmarc(&self) -> CheckStatus {
        let name = format!("_dmarc.{}", self.sender_domain);
        match self.txt_record_with_prefix(&name, "v=DMARC1").await {
            Ok(Some(record)) => {
                debug!("DMARC record found: {}", record);
                CheckStatus::Pass
            }
            Ok(None) => CheckStatus::Warning(format!("no DMARC record published at {}", name)),
            Err(e) => CheckStatus::Warning(format!("DMARC lookup failed: {}", e)),
        }
    }

    /// Query the reversed sender IP against each blocklist zone. A name that
    /// resolves means the IP is listed there.
    async fn check_dnsbl(&self) -> CheckStatus {
        let Some(raw_ip) = &self.sender_ip else {
            return CheckStatus::Warning(
                "sender IP not configured; blocklist check skipped".to_string(),
            );
        };
        let ip: Ipv4Addr = match raw_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return CheckStatus::Warning(format!("sender IP '{}' is not a valid IPv4 address", raw_ip));
            }
        };

        let octets = ip.octets();
        let reversed = format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0]);

        let mut listed = Vec::new();
        for zone in &self.dnsbl_zones {
            let query = format!("{}.{}", reversed, zone);
            match self.resolver.ipv4_lookup(query).await {
                Ok(_) => {
                    warn!("sender IP {} is listed on {}", ip, zone);
                    listed.push(zone.clone());
                }
                Err(e) if is_no_records(&e) => {}
                Err(e) => debug!("blocklist query against {} failed: {}", zone, e),
            }
        }

        if listed.is_empty() {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail(format!("sender IP {} listed on: {}", ip, listed.join(", ")))
        }
    }

    /// The cached sender verdict; computed on first use, reused for the rest
    /// of the run.
    pub async fn sender_checks(&self) -> &[CheckResult] {
        self.cache
            .get_or_init(|| async {
                vec![
                    CheckResult {
                        name: "spf".to_string(),
                        status: self.check_spf().await,
                    },
                    CheckResult {
                        name: "dmarc".to_string(),
                        status: self.check_dmarc().await,
                    },
                    CheckResult {
                        name: "ip_reputation".to_string(),
                        status: self.check_dnsbl().await,
                    },
                ]
            })
            .await
    }
}
