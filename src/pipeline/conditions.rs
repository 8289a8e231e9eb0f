//! Condition language and its evaluator.
//!
//! Evaluation is pure: no I/O, no side effects. Each populated top-level
//! sub-condition yields one boolean; the results are folded with AND
//! (`matchType: all`) or OR (`matchType: any`). A condition with nothing
//! populated matches every message.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pipeline::types::{Message, days_before};

/// How sub-condition results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    All,
    Any,
}

/// A rule's match condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub match_type: MatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<TextCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<TextCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<TextCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<TextCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_flagged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_unread: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<DateCondition>,
    /// KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_greater_than: Option<u64>,
    /// KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_less_than: Option<u64>,
}

impl Condition {
    /// Number of populated top-level sub-conditions.
    pub fn populated_count(&self) -> usize {
        [
            self.from.is_some(),
            self.to.is_some(),
            self.subject.is_some(),
            self.body.is_some(),
            self.has_attachment.is_some(),
            self.is_flagged.is_some(),
            self.is_unread.is_some(),
            self.received.is_some(),
            self.size_greater_than.is_some(),
            self.size_less_than.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Populated text sub-conditions, labelled by field.
    pub fn text_conditions(&self) -> impl Iterator<Item = (&'static str, &TextCondition)> {
        [
            ("from", self.from.as_ref()),
            ("to", self.to.as_ref()),
            ("subject", self.subject.as_ref()),
            ("body", self.body.as_ref()),
        ]
        .into_iter()
        .filter_map(|(field, tc)| tc.map(|tc| (field, tc)))
    }
}

// ── Text ────────────────────────────────────────────────────────────

/// Which comparison a text condition performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMatch {
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Equals(String),
    Regex(String),
}

/// A single text comparison.
///
/// When several operators are present in the source JSON, the first in
/// `contains, startsWith, endsWith, equals, regex` order wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TextConditionDef", into = "TextConditionDef")]
pub struct TextCondition {
    pub matcher: TextMatch,
    pub case_sensitive: bool,
}

impl TextCondition {
    pub fn contains(value: &str) -> Self {
        Self::new(TextMatch::Contains(value.into()))
    }

    pub fn starts_with(value: &str) -> Self {
        Self::new(TextMatch::StartsWith(value.into()))
    }

    pub fn ends_with(value: &str) -> Self {
        Self::new(TextMatch::EndsWith(value.into()))
    }

    pub fn equals(value: &str) -> Self {
        Self::new(TextMatch::Equals(value.into()))
    }

    pub fn regex(pattern: &str) -> Self {
        Self::new(TextMatch::Regex(pattern.into()))
    }

    fn new(matcher: TextMatch) -> Self {
        Self {
            matcher,
            case_sensitive: false,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    /// Test one value.
    pub fn matches(&self, value: &str) -> bool {
        match &self.matcher {
            TextMatch::Contains(needle) => self.fold(value).contains(&*self.fold(needle)),
            TextMatch::StartsWith(needle) => {
                self.fold(value).starts_with(&*self.fold(needle))
            }
            TextMatch::EndsWith(needle) => self.fold(value).ends_with(&*self.fold(needle)),
            TextMatch::Equals(needle) => self.fold(value) == self.fold(needle),
            TextMatch::Regex(pattern) => match RegexBuilder::new(pattern)
                .case_insensitive(!self.case_sensitive)
                .build()
            {
                Ok(re) => re.is_match(value),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid regex in text condition");
                    false
                }
            },
        }
    }

    /// Compile error for a regex matcher, if the pattern is invalid.
    pub fn regex_error(&self) -> Option<String> {
        match &self.matcher {
            TextMatch::Regex(pattern) => RegexBuilder::new(pattern)
                .build()
                .err()
                .map(|e| e.to_string()),
            _ => None,
        }
    }

    /// True if any value matches.
    pub fn matches_any<'a>(&self, mut values: impl Iterator<Item = &'a str>) -> bool {
        values.any(|v| self.matches(v))
    }

    fn fold<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if self.case_sensitive {
            Cow::Borrowed(s)
        } else {
            Cow::Owned(s.to_lowercase())
        }
    }
}

/// Wire form of a text condition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextConditionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    starts_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ends_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    case_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    case_insensitive: Option<bool>,
}

impl TryFrom<TextConditionDef> for TextCondition {
    type Error = String;

    fn try_from(def: TextConditionDef) -> Result<Self, Self::Error> {
        let matcher = if let Some(v) = def.contains {
            TextMatch::Contains(v)
        } else if let Some(v) = def.starts_with {
            TextMatch::StartsWith(v)
        } else if let Some(v) = def.ends_with {
            TextMatch::EndsWith(v)
        } else if let Some(v) = def.equals {
            TextMatch::Equals(v)
        } else if let Some(v) = def.regex {
            TextMatch::Regex(v)
        } else {
            return Err(
                "text condition needs one of contains, startsWith, endsWith, equals, regex".into(),
            );
        };

        let case_sensitive = match (def.case_sensitive, def.case_insensitive) {
            (Some(sensitive), _) => sensitive,
            (None, Some(insensitive)) => !insensitive,
            (None, None) => false,
        };

        Ok(Self {
            matcher,
            case_sensitive,
        })
    }
}

impl From<TextCondition> for TextConditionDef {
    fn from(cond: TextCondition) -> Self {
        let mut def = TextConditionDef {
            case_sensitive: Some(cond.case_sensitive),
            ..Default::default()
        };
        match cond.matcher {
            TextMatch::Contains(v) => def.contains = Some(v),
            TextMatch::StartsWith(v) => def.starts_with = Some(v),
            TextMatch::EndsWith(v) => def.ends_with = Some(v),
            TextMatch::Equals(v) => def.equals = Some(v),
            TextMatch::Regex(v) => def.regex = Some(v),
        }
        def
    }
}

// ── Date ────────────────────────────────────────────────────────────

/// Received-date checks. Every populated check must pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DateCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within_last_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub older_than_days: Option<u32>,
}

impl DateCondition {
    pub fn matches(&self, received: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if let Some(before) = self.before
            && received >= before
        {
            return false;
        }
        if let Some(after) = self.after
            && received <= after
        {
            return false;
        }
        if let Some(days) = self.within_last_days
            && received < days_before(now, days)
        {
            return false;
        }
        if let Some(days) = self.older_than_days
            && received >= days_before(now, days)
        {
            return false;
        }
        true
    }
}

// ── Evaluator ───────────────────────────────────────────────────────

/// Evaluate a condition against a message at the current time.
pub fn evaluate(message: &Message, condition: &Condition) -> bool {
    evaluate_at(message, condition, Utc::now())
}

/// Evaluate a condition against a message with an explicit clock.
pub fn evaluate_at(message: &Message, condition: &Condition, now: DateTime<Utc>) -> bool {
    let mut results: Vec<bool> = Vec::with_capacity(condition.populated_count());

    if let Some(text) = &condition.from {
        results.push(text.matches_any(message.originator_addresses()));
    }
    if let Some(text) = &condition.to {
        results.push(text.matches_any(message.recipient_addresses()));
    }
    if let Some(text) = &condition.subject {
        results.push(text.matches(&message.subject));
    }
    if let Some(text) = &condition.body {
        results.push(text.matches(&message.body));
    }
    if let Some(expected) = condition.has_attachment {
        results.push(message.has_attachment == expected);
    }
    if let Some(expected) = condition.is_flagged {
        results.push(message.is_flagged() == expected);
    }
    if let Some(expected) = condition.is_unread {
        results.push(!message.is_seen() == expected);
    }
    if let Some(date) = &condition.received {
        results.push(date.matches(message.received_at, now));
    }
    if let Some(kib) = condition.size_greater_than {
        results.push(message.size > kib.saturating_mul(1024));
    }
    if let Some(kib) = condition.size_less_than {
        results.push(message.size < kib.saturating_mul(1024));
    }

    if results.is_empty() {
        return true;
    }

    match condition.match_type {
        MatchType::All => results.iter().all(|r| *r),
        MatchType::Any => results.iter().any(|r| *r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::pipeline::types::{Flag, Uid};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn make_message(from: &str, subject: &str) -> Message {
        Message {
            uid: Uid(42),
            from: vec![from.into()],
            sender: vec![],
            reply_to: vec![],
            to: vec!["me@example.com".into()],
            cc: vec![],
            bcc: vec!["hidden@example.com".into()],
            subject: subject.into(),
            body: "Click here to read more".into(),
            flags: BTreeSet::new(),
            has_attachment: false,
            size: 4 * 1024,
            received_at: at("2026-03-10T12:00:00Z"),
            message_id: None,
            raw: Vec::new(),
        }
    }

    #[test]
    fn case_insensitive_contains_matches_uppercase_address() {
        let cond = TextCondition::contains("newsletter");
        assert!(cond.matches("PROMO@NEWSLETTER.COM"));
    }

    #[test]
    fn case_sensitive_contains_respects_case() {
        let cond = TextCondition::contains("newsletter").case_sensitive();
        assert!(!cond.matches("PROMO@NEWSLETTER.COM"));
        assert!(cond.matches("promo@newsletter.com"));
    }

    #[test]
    fn text_operators() {
        assert!(TextCondition::starts_with("promo@").matches("promo@x.com"));
        assert!(!TextCondition::starts_with("x.com").matches("promo@x.com"));
        assert!(TextCondition::ends_with("@X.COM").matches("promo@x.com"));
        assert!(TextCondition::equals("Weekly Digest").matches("weekly digest"));
        assert!(!TextCondition::equals("Weekly").matches("Weekly Digest"));
        assert!(TextCondition::regex(r"^invoice #\d+").matches("Invoice #123 attached"));
    }

    #[test]
    fn invalid_regex_never_matches() {
        assert!(!TextCondition::regex("(unclosed").matches("(unclosed"));
    }

    #[test]
    fn first_populated_operator_wins() {
        let cond: TextCondition =
            serde_json::from_str(r#"{"equals": "nope", "contains": "digest"}"#).unwrap();
        assert_eq!(cond.matcher, TextMatch::Contains("digest".into()));
        assert!(cond.matches("Weekly Digest"));
    }

    #[test]
    fn case_flags_from_json() {
        let insensitive: TextCondition =
            serde_json::from_str(r#"{"contains": "x", "caseInsensitive": true}"#).unwrap();
        assert!(!insensitive.case_sensitive);

        let sensitive: TextCondition =
            serde_json::from_str(r#"{"contains": "x", "caseInsensitive": false}"#).unwrap();
        assert!(sensitive.case_sensitive);

        let explicit: TextCondition =
            serde_json::from_str(r#"{"contains": "x", "caseSensitive": true}"#).unwrap();
        assert!(explicit.case_sensitive);

        let default: TextCondition = serde_json::from_str(r#"{"contains": "x"}"#).unwrap();
        assert!(!default.case_sensitive);
    }

    #[test]
    fn empty_text_condition_rejected() {
        let result: Result<TextCondition, _> = serde_json::from_str(r#"{"caseSensitive": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn empty_condition_matches_everything() {
        let msg = make_message("anyone@example.com", "Anything");
        assert!(evaluate(&msg, &Condition::default()));
        let any = Condition {
            match_type: MatchType::Any,
            ..Default::default()
        };
        assert!(evaluate(&msg, &any));
    }

    #[test]
    fn match_all_requires_both() {
        let msg = make_message("promo@newsletter.com", "Weekly Digest");
        let mut cond = Condition {
            from: Some(TextCondition::contains("newsletter")),
            subject: Some(TextCondition::contains("weekly")),
            ..Default::default()
        };
        assert!(evaluate(&msg, &cond));

        cond.subject = Some(TextCondition::contains("monthly"));
        assert!(!evaluate(&msg, &cond));
    }

    #[test]
    fn match_any_requires_one() {
        let msg = make_message("promo@newsletter.com", "Weekly Digest");
        let mut cond = Condition {
            match_type: MatchType::Any,
            from: Some(TextCondition::contains("boss")),
            subject: Some(TextCondition::contains("weekly")),
            ..Default::default()
        };
        assert!(evaluate(&msg, &cond));

        cond.subject = Some(TextCondition::contains("monthly"));
        assert!(!evaluate(&msg, &cond));
    }

    #[test]
    fn from_checks_sender_and_reply_to() {
        let mut msg = make_message("person@example.com", "Hi");
        msg.reply_to = vec!["list@lists.example.org".into()];
        let cond = Condition {
            from: Some(TextCondition::ends_with("lists.example.org")),
            ..Default::default()
        };
        assert!(evaluate(&msg, &cond));
    }

    #[test]
    fn to_checks_bcc() {
        let msg = make_message("a@b.com", "Hi");
        let cond = Condition {
            to: Some(TextCondition::equals("hidden@example.com")),
            ..Default::default()
        };
        assert!(evaluate(&msg, &cond));
    }

    #[test]
    fn boolean_sub_conditions() {
        let mut msg = make_message("a@b.com", "Hi");
        msg.flags = BTreeSet::from([Flag::Flagged]);
        let cond = Condition {
            is_flagged: Some(true),
            is_unread: Some(true),
            has_attachment: Some(false),
            ..Default::default()
        };
        assert!(evaluate(&msg, &cond));

        msg.flags.insert(Flag::Seen);
        assert!(!evaluate(&msg, &cond));
    }

    #[test]
    fn size_is_compared_in_kib() {
        let msg = make_message("a@b.com", "Hi");
        let bigger = Condition {
            size_greater_than: Some(3),
            ..Default::default()
        };
        assert!(evaluate(&msg, &bigger));

        let exact = Condition {
            size_greater_than: Some(4),
            ..Default::default()
        };
        assert!(!evaluate(&msg, &exact));

        let smaller = Condition {
            size_less_than: Some(5),
            ..Default::default()
        };
        assert!(evaluate(&msg, &smaller));
    }

    #[test]
    fn before_and_after_are_strict() {
        let received = at("2026-03-10T12:00:00Z");
        let now = at("2026-03-20T00:00:00Z");
        let on_the_instant = DateCondition {
            before: Some(received),
            ..Default::default()
        };
        assert!(!on_the_instant.matches(received, now));

        let window = DateCondition {
            after: Some(at("2026-03-01T00:00:00Z")),
            before: Some(at("2026-04-01T00:00:00Z")),
            ..Default::default()
        };
        assert!(window.matches(received, now));
    }

    #[test]
    fn relative_day_windows() {
        let now = at("2026-03-20T12:00:00Z");
        let received = at("2026-03-10T12:00:00Z");

        let recent = DateCondition {
            within_last_days: Some(14),
            ..Default::default()
        };
        assert!(recent.matches(received, now));

        let too_recent = DateCondition {
            within_last_days: Some(7),
            ..Default::default()
        };
        assert!(!too_recent.matches(received, now));

        let old = DateCondition {
            older_than_days: Some(7),
            ..Default::default()
        };
        assert!(old.matches(received, now));

        let both = DateCondition {
            within_last_days: Some(14),
            older_than_days: Some(30),
            ..Default::default()
        };
        assert!(!both.matches(received, now));
    }

    #[test]
    fn huge_day_windows_saturate() {
        let now = at("2026-03-20T12:00:00Z");
        let received = at("1970-01-01T00:00:00Z");

        let forever = DateCondition {
            within_last_days: Some(u32::MAX),
            ..Default::default()
        };
        assert!(forever.matches(received, now));

        let never = DateCondition {
            older_than_days: Some(u32::MAX),
            ..Default::default()
        };
        assert!(!never.matches(received, now));

        let mut message = make_message("a@b.com", "old");
        message.received_at = received;
        let condition: Condition =
            serde_json::from_str(r#"{"received": {"withinLastDays": 4294967295}}"#).unwrap();
        assert!(evaluate_at(&message, &condition, now));
    }

    #[test]
    fn empty_date_condition_passes() {
        let now = at("2026-03-20T12:00:00Z");
        assert!(DateCondition::default().matches(now, now));
    }

    #[test]
    fn condition_parses_from_json() {
        let cond: Condition = serde_json::from_str(
            r#"{
                "matchType": "any",
                "subject": {"contains": "weekly", "caseInsensitive": true},
                "received": {"olderThanDays": 30},
                "sizeGreaterThan": 512
            }"#,
        )
        .unwrap();
        assert_eq!(cond.match_type, MatchType::Any);
        assert_eq!(cond.populated_count(), 3);
        assert_eq!(cond.received.unwrap().older_than_days, Some(30));
    }
}
