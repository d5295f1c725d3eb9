//! Content heuristics
//!
//! Keyword, URL and shape checks that estimate how likely a message is to be
//! spam-filtered. Advisory only: everything reported here is a warning, and
//! every rule runs regardless of what the others found.

use regex::Regex;

/// Spam trigger phrases, English plus the Chinese set the original corpus
/// was tuned for.
const SPAM_KEYWORDS: &[&str] = &[
    // English
    "free money",
    "click here",
    "act now",
    "limited time",
    "congratulations",
    "you won",
    "winner",
    "prize",
    "urgent",
    "verify account",
    "suspended account",
    "lowest price",
    "buy now",
    "earn money",
    "work from home",
    "make money fast",
    "casino",
    "viagra",
    // Chinese
    "点击领取",
    "立即领取",
    "恭喜中奖",
    "中奖通知",
    "账户异常",
    "限时优惠",
    "最后机会",
    "日赚",
    "月入",
    "无抵押",
    "快速放款",
];

/// A matched content rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentIssue {
    pub rule: &'static str,
    pub detail: String,
}

/// Content checker with precompiled patterns.
pub struct ContentChecker {
    url_re: Regex,
    suspicious_url_res: Vec<Regex>,
    /// Sane body length band in characters.
    min_body_len: usize,
    max_body_len: usize,
    /// Raw URL count above which the message looks link-stuffed.
    max_urls: usize,
}

impl Default for ContentChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentChecker {
    pub fn new() -> Self {
        let suspicious = [
            // Link shorteners
            r"(?i)bit\.ly",
            r"(?i)tinyurl\.com",
            r"(?i)goo\.gl",
            // Raw IP hosts
            r"https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
            // Free TLDs
            r"(?i)\.(tk|ml|ga|cf)(/|$)",
        ];
        Self {
            url_re: Regex::new(r#"(?i)https?://[^\s<>"]+|www\.[^\s<>"]+"#).unwrap(),
            suspicious_url_res: suspicious.iter().map(|p| Regex::new(p).unwrap()).collect(),
            min_body_len: 50,
            max_body_len: 100_000,
            max_urls: 10,
        }
    }

    fn spam_keywords(&self, text: &str) -> Vec<&'static str> {
        let lower = text.to_lowercase();
        SPAM_KEYWORDS
            .iter()
            .copied()
            .filter(|k| lower.contains(&k.to_lowercase()))
            .collect()
    }

    fn suspicious_urls(&self, text: &str) -> Vec<String> {
        self.url_re
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .filter(|url| self.suspicious_url_res.iter().any(|re| re.is_match(url)))
            .collect()
    }

    /// Run every rule over subject and body; collect all findings.
    pub fn check(&self, subject: &str, body: &str) -> Vec<ContentIssue> {
        let mut issues = Vec::new();

        let mut keywords = self.spam_keywords(subject);
        keywords.extend(self.spam_keywords(body));
        keywords.sort_unstable();
        keywords.dedup();
        if !keywords.is_empty() {
            issues.push(ContentIssue {
                rule: "spam_keywords",
                detail: format!(
                    "{} spam trigger phrase(s): {}",
                    keywords.len(),
                    keywords[..keywords.len().min(5)].join(", ")
                ),
            });
        }

        let suspicious = self.suspicious_urls(body);
        if !suspicious.is_empty() {
            issues.push(ContentIssue {
                rule: "suspicious_urls",
                detail: format!(
                    "{} suspicious URL(s): {}",
                    suspicious.len(),
                    suspicious[..suspicious.len().min(3)].join(", ")
                ),
            });
        }

        let url_count = self.url_re.find_iter(body).count();
        if url_count > self.max_urls {
            issues.push(ContentIssue {
                rule: "url_count",
                detail: format!("{} raw URLs in body (max {})", url_count, self.max_urls),
            });
        }

        let letters: Vec<char> = subject.chars().filter(|c| c.is_alphabetic()).collect();
        if subject.chars().count() > 10
            && !letters.is_empty()
            && letters.iter().all(|c| c.is_uppercase())
        {
            issues.push(ContentIssue {
                rule: "all_caps_subject",
                detail: "subject is entirely upper-case".to_string(),
            });
        }

        let body_len = body.chars().count();
        if body_len < self.min_body_len {
            issues.push(ContentIssue {
                rule: "body_too_short",
                detail: format!("body is {} chars (min {})", body_len, self.min_body_len),
            });
        } else if body_len > self.max_body_len {
            issues.push(ContentIssue {
                rule: "body_too_long",
                detail: format!("body is {} chars (max {})", body_len, self.max_body_len),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_enough(text: &str) -> String {
        format!("{} {}", text, "lorem ipsum dolor sit amet ".repeat(3))
    }

    #[test]
    fn test_clean_content_has_no_issues() {
        let checker = ContentChecker::new();
        let issues = checker.check(
            "Quarterly report",
            &long_enough("Please find the quarterly report attached."),
        );
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn test_spam_keywords_detected_in_subject_and_body() {
        let checker = ContentChecker::new();
        let issues = checker.check(
            "Congratulations, you won",
            &long_enough("Click here to claim your prize"),
        );
        let rules: Vec<_> = issues.iter().map(|i| i.rule).collect();
        assert!(rules.contains(&"spam_keywords"));
    }

    #[test]
    fn test_chinese_keywords_detected() {
        let checker = ContentChecker::new();
        let issues = checker.check("恭喜中奖", &long_enough("请点击领取您的奖金"));
        assert!(issues.iter().any(|i| i.rule == "spam_keywords"));
    }

    #[test]
    fn test_suspicious_urls() {
        let checker = ContentChecker::new();
        let issues = checker.check(
            "Link",
            &long_enough("details at http://bit.ly/abc and http://10.0.0.1/x"),
        );
        let issue = issues.iter().find(|i| i.rule == "suspicious_urls").unwrap();
        assert!(issue.detail.contains("2 suspicious URL"));
    }

    #[test]
    fn test_all_rules_run_without_short_circuit() {
        let checker = ContentChecker::new();
        // Short, shouty, spammy and link-stuffed at once.
        let issues = checker.check("YOU WON A PRIZE", "click here http://bit.ly/a");
        let rules: Vec<_> = issues.iter().map(|i| i.rule).collect();
        assert!(rules.contains(&"spam_keywords"));
        assert!(rules.contains(&"suspicious_urls"));
        assert!(rules.contains(&"all_caps_subject"));
        assert!(rules.contains(&"body_too_short"));
    }

    #[test]
    fn test_body_length_band() {
        let checker = ContentChecker::new();
        let issues = checker.check("Subject line", "hi");
        assert!(issues.iter().any(|i| i.rule == "body_too_short"));

        let issues = checker.check("Subject line", &"a".repeat(100_001));
        assert!(issues.iter().any(|i| i.rule == "body_too_long"));
    }
}
