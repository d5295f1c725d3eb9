//! Template rendering - personalization of subject and body content
//!
//! Pure string substitution over the three roster variable slots plus the
//! sender identity, with unresolved placeholders stripped. Also builds the
//! unsubscribe machinery the compliance headers need: a signed-ish token,
//! the List-Unsubscribe value, and an optional body footer.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use postrider_common::types::TemplateVars;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Renders message templates for one run.
pub struct TemplateRenderer {
    subject_template: String,
    body_template: String,
    html_template: Option<String>,
    sender_name: String,
    placeholder_re: Regex,
}

impl TemplateRenderer {
    pub fn new(
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
        html_template: Option<String>,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            subject_template: subject_template.into(),
            body_template: body_template.into(),
            html_template,
            sender_name: sender_name.into(),
            placeholder_re: Regex::new(r"\{\{[^}]+\}\}").unwrap(),
        }
    }

    fn substitute(&self, template: &str, email: &str, vars: &TemplateVars) -> String {
        let mut result = template.to_string();
        result = result.replace("{{var1}}", &vars.var1);
        result = result.replace("{{var2}}", &vars.var2);
        result = result.replace("{{var3}}", &vars.var3);
        result = result.replace("{{email}}", email);
        result = result.replace("{{sender_name}}", &self.sender_name);
        self.placeholder_re.replace_all(&result, "").to_string()
    }

    /// Render the subject line for one recipient.
    pub fn render_subject(&self, email: &str, vars: &TemplateVars) -> String {
        self.substitute(&self.subject_template, email, vars)
    }

    /// Render the plain-text body for one recipient.
    pub fn render_body(&self, email: &str, vars: &TemplateVars) -> String {
        self.substitute(&self.body_template, email, vars)
    }

    /// Render the HTML body, when the run carries an HTML template.
    pub fn render_html(&self, email: &str, vars: &TemplateVars) -> Option<String> {
        self.html_template
            .as_ref()
            .map(|t| self.substitute(t, email, vars))
    }
}

/// Opaque unsubscribe token for one recipient: the address plus a truncated
/// digest, URL-safe encoded.
pub fn unsubscribe_token(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    let digest = hasher.finalize();
    let payload = format!("{}:{}", email, hex::encode(&digest[..8]));
    URL_SAFE_NO_PAD.encode(payload.as_bytes())
}

/// Decode an unsubscribe token back to the address it was built for.
pub fn parse_unsubscribe_token(token: &str) -> Option<String> {
    let decoded = URL_SAFE_NO_PAD.decode(token).ok()?;
    let payload = String::from_utf8(decoded).ok()?;
    let (email, digest_hex) = payload.rsplit_once(':')?;

    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    let digest = hasher.finalize();
    if hex::encode(&digest[..8]) != digest_hex {
        return None;
    }
    Some(email.to_string())
}

/// Build the List-Unsubscribe header value: mailto and/or URL form.
pub fn list_unsubscribe_value(
    recipient: &str,
    mailto: Option<&str>,
    url_base: Option<&str>,
) -> Option<String> {
    let url = url_base.map(|base| {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            unsubscribe_token(recipient)
        )
    });
    match (mailto, url) {
        (Some(mailto), Some(url)) => {
            Some(format!("<mailto:{}?subject=unsubscribe>, <{}>", mailto, url))
        }
        (Some(mailto), None) => Some(format!("<mailto:{}?subject=unsubscribe>", mailto)),
        (None, Some(url)) => Some(format!("<{}>", url)),
        (None, None) => None,
    }
}

/// Append an unsubscribe notice to a body.
pub fn unsubscribe_footer(body: &str, mailto: &str, html: bool) -> String {
    if html {
        format!(
            "{}\n<hr>\n<p style=\"font-size:12px;color:#666\">To stop receiving these messages, \
             reply to <a href=\"mailto:{m}?subject=unsubscribe\">{m}</a> with subject \
             \"unsubscribe\".</p>\n",
            body,
            m = mailto
        )
    } else {
        format!(
            "{}\n\n--\nTo stop receiving these messages, reply to {} with subject \"unsubscribe\".\n",
            body, mailto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars() -> TemplateVars {
        TemplateVars {
            var1: "Jane".to_string(),
            var2: "Acme Corp".to_string(),
            var3: String::new(),
        }
    }

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(
            "Hello {{var1}}",
            "Dear {{var1}} of {{var2}},\n\nRegards,\n{{sender_name}}",
            None,
            "The Sender",
        )
    }

    #[test]
    fn test_render_subject_and_body() {
        let r = renderer();
        let v = vars();
        assert_eq!(r.render_subject("jane@acme.test", &v), "Hello Jane");
        assert_eq!(
            r.render_body("jane@acme.test", &v),
            "Dear Jane of Acme Corp,\n\nRegards,\nThe Sender"
        );
    }

    #[test]
    fn test_unused_placeholders_are_stripped() {
        let r = TemplateRenderer::new("{{var1}} {{unknown}}!", "", None, "S");
        assert_eq!(r.render_subject("a@b.test", &vars()), "Jane !");
    }

    #[test]
    fn test_html_rendered_only_when_present() {
        let r = renderer();
        assert!(r.render_html("a@b.test", &vars()).is_none());

        let r = TemplateRenderer::new("s", "b", Some("<p>{{var1}}</p>".into()), "S");
        assert_eq!(
            r.render_html("a@b.test", &vars()).as_deref(),
            Some("<p>Jane</p>")
        );
    }

    #[test]
    fn test_unsubscribe_token_roundtrip() {
        let token = unsubscribe_token("user@example.com");
        assert_eq!(
            parse_unsubscribe_token(&token).as_deref(),
            Some("user@example.com")
        );
    }

    #[test]
    fn test_tampered_token_rejected() {
        let mut token = unsubscribe_token("user@example.com");
        token.push('x');
        assert!(parse_unsubscribe_token(&token).is_none());
    }

    #[test]
    fn test_list_unsubscribe_forms() {
        assert_eq!(
            list_unsubscribe_value("u@e.test", Some("stop@e.test"), None).unwrap(),
            "<mailto:stop@e.test?subject=unsubscribe>"
        );
        let both =
            list_unsubscribe_value("u@e.test", Some("stop@e.test"), Some("https://e.test/u/"))
                .unwrap();
        assert!(both.starts_with("<mailto:stop@e.test?subject=unsubscribe>, <https://e.test/u/"));
        assert!(list_unsubscribe_value("u@e.test", None, None).is_none());
    }

    #[test]
    fn test_footer_plain_and_html() {
        let plain = unsubscribe_footer("body", "stop@e.test", false);
        assert!(plain.starts_with("body\n\n--\n"));
        assert!(plain.contains("stop@e.test"));

        let html = unsubscribe_footer("<p>body</p>", "stop@e.test", true);
        assert!(html.contains("<hr>"));
        assert!(html.contains("mailto:stop@e.test"));
    }
}
