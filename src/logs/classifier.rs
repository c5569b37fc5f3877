//! Line classification into the fixed mail event taxonomy.
//!
//! Rules are evaluated in [`Category`] order and the first match wins, so a
//! bounce notice that also mentions a quota is a `failed_delivery`, not a
//! `quota_fail`.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};

/// Mail event categories in matching precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sent,
    FailedDelivery,
    Incoming,
    Greylisted,
    RblReject,
    Rejected,
    SpamVirus,
    QuotaFail,
    AuthFail,
}

impl Category {
    /// Every category, in precedence order.
    pub const ALL: [Self; 9] = [
        Self::Sent,
        Self::FailedDelivery,
        Self::Incoming,
        Self::Greylisted,
        Self::RblReject,
        Self::Rejected,
        Self::SpamVirus,
        Self::QuotaFail,
        Self::AuthFail,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::FailedDelivery => "failed_delivery",
            Self::Incoming => "incoming",
            Self::Greylisted => "greylisted",
            Self::RblReject => "rbl_reject",
            Self::Rejected => "rejected",
            Self::SpamVirus => "spam_virus",
            Self::QuotaFail => "quota_fail",
            Self::AuthFail => "auth_fail",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MpError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| MpError::Runtime {
                details: format!("unknown category {s:?}"),
            })
    }
}

/// Something that can decide whether a log line belongs to a category.
pub trait LineMatcher: Send + Sync {
    fn matches(&self, line: &str) -> bool;
}

/// Case-insensitive regex alternatives; any match counts.
#[derive(Debug, Clone)]
pub struct RegexRule {
    patterns: Vec<Regex>,
}

impl RegexRule {
    pub fn new(patterns: &[&str]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| compile(pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl LineMatcher for RegexRule {
    fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(line))
    }
}

/// Rule text per category, in precedence order.
const RULES: [(Category, &[&str]); 9] = [
    (
        Category::Sent,
        &[
            r"\bstatus=sent\b",
            r"postfix/(local|virtual|pipe).*status=sent",
            r"dovecot-lda.*saved mail to",
        ],
    ),
    (Category::FailedDelivery, &[r"\bstatus=(deferred|bounced)\b"]),
    (
        Category::Incoming,
        &[r"postfix/smtpd.*client=|postfix/cleanup|qmgr:.*\bfrom="],
    ),
    (Category::Greylisted, &[r"greylist(ed)?"]),
    (Category::RblReject, &[r"RBL|blacklist"]),
    (
        Category::Rejected,
        &[r"NOQUEUE:\s*reject|\sreject(\b|:)|blocked|policy"],
    ),
    (
        Category::SpamVirus,
        &[
            r"(amavis|rspamd|clamd|clamav).*(reject|discard|virus|malware|spam)",
            r"\b(spam|virus)\s+(reject|discard|found)\b",
        ],
    ),
    (
        Category::QuotaFail,
        &[r"quota|mail(box)?\s*full|exceed(ed)?\s*storage"],
    ),
    (
        Category::AuthFail,
        &[r"SASL\s+(LOGIN|PLAIN)\s+authentication\s+failed|auth(entication)?\s+failed"],
    ),
];

/// Union of every rule's trigger text.
///
/// Only POSIX bracket classes are used so the same text works for the
/// `regex` crate and for `grep -E -i`. A line the classifier would accept
/// always matches this pattern.
pub const PREFILTER_PATTERN: &str = concat!(
    "status=sent|status=(deferred|bounced)|dovecot-lda.*saved mail to",
    "|postfix/smtpd|postfix/cleanup|qmgr:.*from=",
    "|greylist|RBL|blacklist",
    "|NOQUEUE:[[:space:]]*reject|[[:space:]]reject|blocked|policy",
    "|amavis|rspamd|clamd|clamav|(spam|virus)[[:space:]]+(reject|discard|found)",
    "|quota|mail(box)?[[:space:]]*full|exceed(ed)?[[:space:]]*storage",
    "|SASL[[:space:]]+(LOGIN|PLAIN)[[:space:]]+authentication[[:space:]]+failed",
    "|auth(entication)?[[:space:]]+failed",
);

/// Ordered rule list plus the compiled pre-filter.
pub struct Classifier {
    rules: Vec<(Box<dyn LineMatcher>, Category)>,
    prefilter: Regex,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("rules", &self.rules.len())
            .field("prefilter", &self.prefilter.as_str())
            .finish()
    }
}

impl Classifier {
    /// The built-in Postfix/Dovecot rule set.
    pub fn new() -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|(category, patterns)| {
                RegexRule::new(patterns)
                    .map(|rule| (Box::new(rule) as Box<dyn LineMatcher>, *category))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::with_rules(rules)
    }

    /// Custom ordered rules; earlier entries take precedence.
    pub fn with_rules(rules: Vec<(Box<dyn LineMatcher>, Category)>) -> Result<Self> {
        Ok(Self {
            rules,
            prefilter: compile(PREFILTER_PATTERN)?,
        })
    }

    /// First matching category, or `None` for an unclassified line.
    pub fn classify(&self, line: &str) -> Option<Category> {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(line))
            .map(|(_, category)| *category)
    }

    /// Cheap superset test applied before timestamp parsing.
    pub fn is_relevant(&self, line: &str) -> bool {
        self.prefilter.is_match(line)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| MpError::Pattern {
            pattern: pattern.to_string(),
            details: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classifier() -> Classifier {
        Classifier::new().expect("built-in rules compile")
    }

    const SAMPLES: [(&str, Category); 12] = [
        (
            "Mar  9 14:02:11 mx postfix/smtp[811]: 4F1A2B3C4D: to=<bob@example.org>, relay=mx.example.org[203.0.113.5]:25, delay=0.4, status=sent (250 2.0.0 Ok)",
            Category::Sent,
        ),
        (
            "Mar  9 14:02:12 mx dovecot-lda(alice): msgid=<x@y>: saved mail to INBOX",
            Category::Sent,
        ),
        (
            "Mar  9 14:02:13 mx postfix/smtp[811]: 4F1A2B3C4D: to=<c@d.e>, status=deferred (connection timed out)",
            Category::FailedDelivery,
        ),
        (
            "Mar  9 14:02:14 mx postfix/smtp[811]: 4F1A2B3C4D: to=<c@d.e>, status=bounced (mailbox full)",
            Category::FailedDelivery,
        ),
        (
            "Mar  9 14:02:15 mx postfix/smtpd[700]: 4F1A2B3C4D: client=unknown[198.51.100.7]",
            Category::Incoming,
        ),
        (
            "Mar  9 14:02:16 mx postfix/cleanup[600]: 4F1A2B3C4D: message-id=<20240309140216.1@example.com>",
            Category::Incoming,
        ),
        (
            "Mar  9 14:02:17 mx postgrey[50]: action=greylist, reason=new, client_name=x",
            Category::Greylisted,
        ),
        (
            "Mar  9 14:02:18 mx postfix/postscreen[40]: NOQUEUE: reject: RCPT from [192.0.2.1]: 550 5.7.1 Service unavailable; client blocked using zen.spamhaus.org; RBL",
            Category::RblReject,
        ),
        (
            "Mar  9 14:02:19 mx postfix/smtpd[700]: NOQUEUE: reject: RCPT from x[192.0.2.9]: 554 5.7.1 Relay access denied",
            Category::Rejected,
        ),
        (
            "Mar  9 14:02:20 mx amavis[300]: (300-01) Blocked SPAM {DiscardedInbound}",
            Category::Rejected,
        ),
        (
            "Mar  9 14:02:21 mx dovecot: imap-login: Over quota for user",
            Category::QuotaFail,
        ),
        (
            "Mar  9 14:02:22 mx postfix/smtpd[700]: warning: unknown[203.0.113.9]: SASL LOGIN authentication failed: UGFzc3dvcmQ6",
            Category::AuthFail,
        ),
    ];

    #[test]
    fn samples_classify_by_precedence() {
        let classifier = classifier();
        for (line, expected) in SAMPLES {
            assert_eq!(classifier.classify(line), Some(expected), "line: {line}");
        }
    }

    #[test]
    fn spam_virus_without_earlier_triggers() {
        let classifier = classifier();
        assert_eq!(
            classifier.classify("Mar  9 14:02:23 mx clamd[1]: stream: Eicar-Signature virus FOUND"),
            Some(Category::SpamVirus)
        );
        assert_eq!(
            classifier.classify("Mar  9 14:02:24 mx rspamd[2]: <abc>; task; spam detected, discard"),
            Some(Category::SpamVirus)
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            classifier().classify("x postfix/smtp: STATUS=SENT (250 ok)"),
            Some(Category::Sent)
        );
    }

    #[test]
    fn unrelated_lines_are_unclassified() {
        let classifier = classifier();
        assert_eq!(
            classifier.classify("Mar  9 14:02:25 mx postfix/anvil[1]: statistics: max connection rate 1/60s"),
            None
        );
        assert!(!classifier.is_relevant("Mar  9 14:02:25 mx systemd[1]: Started Session 4."));
    }

    #[test]
    fn category_names_round_trip() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().ok(), Some(category));
            let json = serde_json::to_string(&category).expect("serialize");
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
        assert!("unclassified".parse::<Category>().is_err());
    }

    #[test]
    fn custom_rules_keep_their_order() {
        struct Contains(&'static str);
        impl LineMatcher for Contains {
            fn matches(&self, line: &str) -> bool {
                line.contains(self.0)
            }
        }
        let classifier = Classifier::with_rules(vec![
            (Box::new(Contains("x")), Category::QuotaFail),
            (Box::new(Contains("x")), Category::Sent),
        ])
        .expect("classifier");
        assert_eq!(classifier.classify("xyz"), Some(Category::QuotaFail));
    }

    #[test]
    fn prefilter_accepts_every_sample() {
        let classifier = classifier();
        for (line, _) in SAMPLES {
            assert!(classifier.is_relevant(line), "prefilter dropped: {line}");
        }
    }

    const TRIGGERS: [&str; 14] = [
        "status=sent",
        "postfix/pipe[3]: ok status=sent",
        "status=deferred",
        "postfix/cleanup[2]: message-id",
        "qmgr: 1: from=<a@b>",
        "greylisted",
        "listed on blacklist",
        "NOQUEUE:reject",
        "client blocked",
        "amavis: spam",
        "virus found",
        "mailbox full",
        "exceeded storage",
        "authentication failed",
    ];

    proptest! {
        #[test]
        fn prefilter_never_drops_classifiable_lines(
            prefix in "[ -~]{0,30}",
            trigger in proptest::sample::select(TRIGGERS.to_vec()),
            suffix in "[ -~]{0,30}",
        ) {
            let classifier = classifier();
            let line = format!("{prefix} {trigger} {suffix}");
            if classifier.classify(&line).is_some() {
                prop_assert!(classifier.is_relevant(&line));
            }
        }

        #[test]
        fn classification_is_deterministic(line in "[ -~]{0,80}") {
            let classifier = classifier();
            prop_assert_eq!(classifier.classify(&line), classifier.classify(&line));
            if classifier.classify(&line).is_some() {
                prop_assert!(classifier.is_relevant(&line));
            }
        }
    }
}
