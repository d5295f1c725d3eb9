//! DKIM signing for outgoing mail (RFC 6376, rsa-sha256)
//!
//! Signing happens strictly after the message is finalized: the signer reads
//! the complete byte stream, canonicalizes headers and body, and prepends
//! the resulting DKIM-Signature header. Any mutation after this point
//! invalidates the signature.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use postrider_common::{Error, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

fn canon_name(canon: Canonicalization) -> &'static str {
    match canon {
        Canonicalization::Simple => "simple",
        Canonicalization::Relaxed => "relaxed",
    }
}

/// DKIM signing configuration
#[derive(Debug, Clone)]
pub struct DkimSigningConfig {
    /// Domain name (d= tag)
    pub domain: String,
    /// Selector (s= tag)
    pub selector: String,
    /// Header canonicalization
    pub header_canon: Canonicalization,
    /// Body canonicalization
    pub body_canon: Canonicalization,
    /// Headers to sign, in signature order
    pub headers_to_sign: Vec<String>,
}

impl DkimSigningConfig {
    pub fn new(domain: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            header_canon: Canonicalization::Relaxed,
            body_canon: Canonicalization::Simple,
            headers_to_sign: vec![
                "from".to_string(),
                "to".to_string(),
                "subject".to_string(),
                "date".to_string(),
                "message-id".to_string(),
                "mime-version".to_string(),
                "content-type".to_string(),
                "list-unsubscribe".to_string(),
            ],
        }
    }
}

/// DKIM signer for outgoing mail
pub struct DkimSigner {
    config: DkimSigningConfig,
    signing_key: SigningKey<Sha256>,
}

impl DkimSigner {
    /// Create a signer from a PKCS#8 PEM key file.
    pub fn from_key_file(config: DkimSigningConfig, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| Error::Signing(format!("failed to read DKIM key {:?}: {}", path, e)))?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| Error::Signing(format!("failed to parse DKIM private key: {}", e)))?;
        Ok(Self::from_private_key(config, private_key))
    }

    /// Create a signer from an already-parsed RSA key.
    pub fn from_private_key(config: DkimSigningConfig, private_key: RsaPrivateKey) -> Self {
        Self {
            config,
            signing_key: SigningKey::<Sha256>::new(private_key),
        }
    }

    /// Sign a finalized message and return the DKIM-Signature header value.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let (headers, body) = split_message(message)?;

        let canon_body = canonicalize_body(&body, self.config.body_canon);
        let body_hash = Sha256::digest(&canon_body);
        let body_hash_b64 = BASE64.encode(body_hash);

        let signed_headers: Vec<String> = self
            .config
            .headers_to_sign
            .iter()
            .filter(|h| headers.contains_key(h.as_str()))
            .cloned()
            .collect();
        if !headers.contains_key("from") {
            return Err(Error::Signing(
                "message has no From header to sign".to_string(),
            ));
        }

        let timestamp = chrono::Utc::now().timestamp();
        let mut dkim_header = format!(
            "v=1; a=rsa-sha256; c={}/{}; d={}; s={}; t={}; h={}; bh={}; b=",
            canon_name(self.config.header_canon),
            canon_name(self.config.body_canon),
            self.config.domain,
            self.config.selector,
            timestamp,
            signed_headers.join(":"),
            body_hash_b64
        );

        let canon_headers = self.canonicalize_headers(&headers, &signed_headers, &dkim_header);
        let signature = self.signing_key.sign(canon_headers.as_bytes());
        dkim_header.push_str(&BASE64.encode(signature.to_bytes().as_ref()));

        Ok(dkim_header)
    }

    /// Sign and return the message with the DKIM-Signature header prepended.
    pub fn sign_and_prepend(&self, message: &[u8]) -> Result<Vec<u8>> {
        let header_value = self.sign(message)?;
        let mut signed = Vec::with_capacity(message.len() + header_value.len() + 32);
        signed.extend_from_slice(b"DKIM-Signature: ");
        signed.extend_from_slice(header_value.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(message);
        Ok(signed)
    }

    /// Canonicalize the signed header set plus the unfinished
    /// DKIM-Signature header itself (without trailing CRLF).
    fn canonicalize_headers(
        &self,
        headers: &HashMap<String, String>,
        signed_headers: &[String],
        dkim_header: &str,
    ) -> String {
        let mut result = String::new();

        for name in signed_headers {
            if let Some(value) = headers.get(name.as_str()) {
                match self.config.header_canon {
                    Canonicalization::Simple => {
                        result.push_str(name);
                        result.push_str(": ");
                        result.push_str(value);
                        result.push_str("\r\n");
                    }
                    Canonicalization::Relaxed => {
                        result.push_str(&name.to_lowercase());
                        result.push(':');
                        result.push_str(&collapse_whitespace(value));
                        result.push_str("\r\n");
                    }
                }
            }
        }

        match self.config.header_canon {
            Canonicalization::Simple => {
                result.push_str("DKIM-Signature: ");
                result.push_str(dkim_header);
            }
            Canonicalization::Relaxed => {
                result.push_str("dkim-signature:");
                result.push_str(&collapse_whitespace(dkim_header));
            }
        }

        result
    }
}

/// Unfold a header value and reduce whitespace runs to single spaces.
fn collapse_whitespace(value: &str) -> String {
    value
        .replace("\r\n", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a message into a lowercased header map and the body text.
fn split_message(message: &[u8]) -> Result<(HashMap<String, String>, String)> {
    let message_str = String::from_utf8_lossy(message);

    let (header_section, body) = if let Some((h, b)) = message_str.split_once("\r\n\r\n") {
        (h, b)
    } else if let Some((h, b)) = message_str.split_once("\n\n") {
        (h, b)
    } else {
        return Err(Error::Signing(
            "could not find header/body separator".to_string(),
        ));
    };

    let mut headers = HashMap::new();
    let mut current_name = String::new();
    let mut current_value = String::new();

    for line in header_section.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            current_value.push(' ');
            current_value.push_str(line.trim());
        } else if let Some((name, value)) = line.split_once(':') {
            if !current_name.is_empty() {
                headers.insert(current_name.to_lowercase(), current_value.clone());
            }
            current_name = name.to_string();
            current_value = value.trim().to_string();
        }
    }
    if !current_name.is_empty() {
        headers.insert(current_name.to_lowercase(), current_value);
    }

    Ok((headers, body.to_string()))
}

/// Canonicalize a message body.
fn canonicalize_body(body: &str, canon: Canonicalization) -> Vec<u8> {
    match canon {
        Canonicalization::Simple => {
            // Normalize to CRLF and reduce trailing empty lines to one CRLF.
            let normalized = body.replace("\r\n", "\n");
            let mut result = normalized.replace('\n', "\r\n");
            while result.ends_with("\r\n\r\n") {
                result.truncate(result.len() - 2);
            }
            if !result.ends_with("\r\n") {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
        Canonicalization::Relaxed => {
            let mut lines: Vec<String> = body
                .lines()
                .map(|line| collapse_whitespace(line).trim_end().to_string())
                .collect();
            while lines.last().is_some_and(|l| l.is_empty()) {
                lines.pop();
            }
            let mut result = lines.join("\r\n");
            if !result.is_empty() {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
    }
}
