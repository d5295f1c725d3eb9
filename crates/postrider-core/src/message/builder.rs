//! Protocol-ready message assembly
//!
//! Builds a complete RFC 5322 message: envelope headers, a
//! `multipart/alternative` body with the plain part first and the HTML part
//! last (clients render the last supported part), a further `mixed` layer
//! when attachments are present, and the compliance headers bulk mail needs
//! (`Date`, `Message-ID`, `List-Unsubscribe`, `Precedence: bulk`). DKIM
//! signing, when configured, runs after everything else is final.

use super::dkim::DkimSigner;
use super::RenderedMessage;
use crate::smtp::MailEnvelope;
use crate::template;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Body, Mailbox, Message, MultiPart, SinglePart};
use lettre::Address;
use postrider_common::{Error, Result};

/// `List-Unsubscribe` header (RFC 2369).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `List-Unsubscribe-Post` header (RFC 8058, one-click unsubscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListUnsubscribePost;

impl Header for ListUnsubscribePost {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(_s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "List-Unsubscribe=One-Click".to_string())
    }
}

/// `Precedence: bulk` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Precedence;

impl Header for Precedence {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Precedence")
    }

    fn parse(_s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "bulk".to_string())
    }
}

/// Sender identity and compliance addresses for the From side of a run.
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub address: String,
    pub name: Option<String>,
    pub reply_to: Option<String>,
    pub unsubscribe_address: Option<String>,
    pub unsubscribe_url: Option<String>,
}

impl SenderIdentity {
    fn domain(&self) -> &str {
        self.address.split('@').nth(1).unwrap_or("localhost")
    }
}

/// A message ready for transmission.
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub envelope: MailEnvelope,
    pub message_id: String,
    pub bytes: Vec<u8>,
}

/// Builds protocol-ready messages for one run.
pub struct MessageBuilder {
    sender: SenderIdentity,
    signer: Option<DkimSigner>,
    html_enabled: bool,
}

impl MessageBuilder {
    pub fn new(sender: SenderIdentity, signer: Option<DkimSigner>, html_enabled: bool) -> Self {
        Self {
            sender,
            signer,
            html_enabled,
        }
    }

    fn parse_mailbox(address: &str, name: Option<&str>) -> Result<Mailbox> {
        let address = address
            .parse::<Address>()
            .map_err(|e| Error::Validation(format!("invalid address '{}': {}", address, e)))?;
        Ok(Mailbox::new(name.map(str::to_string), address))
    }

    /// Globally unique Message-ID for one message.
    fn new_message_id(&self) -> String {
        format!(
            "<{}.{}@{}>",
            uuid::Uuid::new_v4(),
            chrono::Utc::now().timestamp(),
            self.sender.domain()
        )
    }

    /// Assemble the full message for one rendered recipient.
    pub fn build(&self, rendered: &RenderedMessage) -> Result<BuiltMessage> {
        let from = Self::parse_mailbox(&self.sender.address, self.sender.name.as_deref())?;
        let to = Self::parse_mailbox(&rendered.to, None)?;
        let message_id = self.new_message_id();

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(rendered.subject.clone())
            .date_now()
            .message_id(Some(message_id.clone()))
            .header(Precedence);

        if let Some(reply_to) = &self.sender.reply_to {
            if reply_to != &self.sender.address {
                builder = builder.reply_to(Self::parse_mailbox(reply_to, None)?);
            }
        }

        if let Some(value) = template::list_unsubscribe_value(
            &rendered.to,
            self.sender.unsubscribe_address.as_deref(),
            self.sender.unsubscribe_url.as_deref(),
        ) {
            builder = builder.header(ListUnsubscribe(value));
            if self.sender.unsubscribe_url.is_some() {
                builder = builder.header(ListUnsubscribePost);
            }
        }

        let html_body = rendered
            .html_body
            .as_ref()
            .filter(|_| self.html_enabled);

        // Plain first, HTML last: clients prefer the last part they support.
        let content = match html_body {
            Some(html) => BodyContent::Alternative(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(rendered.text_body.clone()))
                    .singlepart(SinglePart::html(html.clone())),
            ),
            None => BodyContent::Plain(SinglePart::plain(rendered.text_body.clone())),
        };

        let message = if rendered.attachments.is_empty() {
            match content {
                BodyContent::Alternative(alternative) => builder.multipart(alternative),
                BodyContent::Plain(plain) => builder.singlepart(plain),
            }
        } else {
            let mut mixed = match content {
                BodyContent::Alternative(alternative) => MultiPart::mixed().multipart(alternative),
                BodyContent::Plain(plain) => MultiPart::mixed().singlepart(plain),
            };
            for attachment in &rendered.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))
                    .map_err(|e| Error::Validation(format!("invalid content type: {}", e)))?;
                mixed = mixed.singlepart(
                    Attachment::new(attachment.file_name.clone())
                        .body(Body::new(attachment.bytes.clone()), content_type),
                );
            }
            builder.multipart(mixed)
        }
        .map_err(|e| Error::Validation(format!("failed to build message: {}", e)))?;

        let mut bytes = message.formatted();

        // Signing must be the last mutation: any later change to headers or
        // body invalidates the signature.
        if let Some(signer) = &self.signer {
            bytes = signer.sign_and_prepend(&bytes)?;
        }

        Ok(BuiltMessage {
            envelope: MailEnvelope {
                from: self.sender.address.clone(),
                to: rendered.to.clone(),
            },
            message_id,
            bytes,
        })
    }
}

enum BodyContent {
    Alternative(MultiPart),
    Plain(SinglePart),
}
