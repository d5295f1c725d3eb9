//! Message assembly: rendered content, attachment resolution, building
//! and signing.

pub mod builder;
pub mod dkim;

pub use builder::{BuiltMessage, MessageBuilder, SenderIdentity};
pub use dkim::{Canonicalization, DkimSigner, DkimSigningConfig};

use std::path::Path;
use tracing::warn;

/// An attachment resolved to bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A fully rendered message for one recipient. Immutable once built; owned
/// by the orchestrator for the duration of one delivery attempt sequence.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<ResolvedAttachment>,
    /// Referenced attachment names that could not be resolved to bytes.
    /// Kept so the validator can fail the attachment check without the
    /// renderer having to abort.
    pub missing_attachments: Vec<String>,
}

/// Resolve attachment references against a directory, collecting both the
/// loaded blobs and the names that failed to resolve.
pub async fn resolve_attachments(
    dir: &Path,
    names: &[String],
) -> (Vec<ResolvedAttachment>, Vec<String>) {
    let mut resolved = Vec::new();
    let mut missing = Vec::new();

    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let path = dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let content_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
                resolved.push(ResolvedAttachment {
                    file_name: name.to_string(),
                    content_type,
                    bytes,
                });
            }
            Err(e) => {
                warn!("attachment {:?} could not be read: {}", path, e);
                missing.push(name.to_string());
            }
        }
    }

    (resolved, missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_attachments_reports_missing() {
        let dir = std::env::temp_dir().join(format!("postrider-att-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("present.pdf"), b"%PDF-1.4 data")
            .await
            .unwrap();

        let (resolved, missing) = resolve_attachments(
            &dir,
            &["present.pdf".to_string(), "absent.pdf".to_string()],
        )
        .await;

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].file_name, "present.pdf");
        assert_eq!(resolved[0].content_type, "application/pdf");
        assert_eq!(missing, vec!["absent.pdf".to_string()]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_references_are_skipped() {
        let dir = std::env::temp_dir();
        let (resolved, missing) =
            resolve_attachments(&dir, &["".to_string(), "  ".to_string()]).await;
        assert!(resolved.is_empty());
        assert!(missing.is_empty());
    }
}
