//! Shared types for the message processing pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

/// Maximum number of cross-account transfer hops for one message lineage.
pub const MAX_CHAIN_DEPTH: u32 = 3;

/// `now` minus `days` whole days, clamped to the earliest representable
/// instant when the subtraction would leave chrono's range.
pub fn days_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ── Identifiers ─────────────────────────────────────────────────────

/// Mailbox-stable message identifier (IMAP UID shaped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Uid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ── Flags ───────────────────────────────────────────────────────────

/// The fixed set of system flags an action may set or clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Seen,
    Flagged,
    Answered,
    Draft,
    Deleted,
}

impl Flag {
    pub const ALL: [Flag; 5] = [
        Flag::Seen,
        Flag::Flagged,
        Flag::Answered,
        Flag::Draft,
        Flag::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Flagged => "flagged",
            Self::Answered => "answered",
            Self::Draft => "draft",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a flag name is not one of the system flags.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown flag '{0}'")]
pub struct UnknownFlag(pub String);

impl FromStr for Flag {
    type Err = UnknownFlag;

    /// Accepts `seen`, `Seen` and `\Seen` forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_start_matches('\\');
        Flag::ALL
            .into_iter()
            .find(|flag| flag.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownFlag(s.to_string()))
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// Immutable snapshot of one message, as fetched from the mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uid: Uid,
    pub from: Vec<String>,
    pub sender: Vec<String>,
    pub reply_to: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    /// Plain text body, or HTML rendered to text.
    pub body: String,
    pub flags: BTreeSet<Flag>,
    pub has_attachment: bool,
    /// Serialized size in bytes.
    pub size: u64,
    pub received_at: DateTime<Utc>,
    /// `Message-ID` header, if present.
    pub message_id: Option<String>,
    /// Raw RFC 822 bytes, used when appending to another account.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Message {
    /// Build a snapshot from raw RFC 822 bytes.
    ///
    /// `received_at` is the server's internal date when known; otherwise the
    /// `Date` header is used, then the current time.
    pub fn from_rfc822(
        uid: Uid,
        raw: &[u8],
        flags: BTreeSet<Flag>,
        received_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let received_at = received_at
            .or_else(|| {
                parsed
                    .date()
                    .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            })
            .unwrap_or_else(Utc::now);

        Some(Self {
            uid,
            from: extract_addresses(parsed.from()),
            sender: extract_addresses(parsed.sender()),
            reply_to: extract_addresses(parsed.reply_to()),
            to: extract_addresses(parsed.to()),
            cc: extract_addresses(parsed.cc()),
            bcc: extract_addresses(parsed.bcc()),
            subject: parsed.subject().unwrap_or_default().to_string(),
            body: extract_text(&parsed),
            flags,
            has_attachment: parsed.attachment_count() > 0,
            size: raw.len() as u64,
            received_at,
            message_id: parsed.message_id().map(String::from),
            raw: raw.to_vec(),
        })
    }

    /// From + Sender + Reply-To.
    pub fn originator_addresses(&self) -> impl Iterator<Item = &str> {
        self.from
            .iter()
            .chain(&self.sender)
            .chain(&self.reply_to)
            .map(String::as_str)
    }

    /// To + Cc + Bcc.
    pub fn recipient_addresses(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }

    pub fn is_seen(&self) -> bool {
        self.flags.contains(&Flag::Seen)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.contains(&Flag::Flagged)
    }
}

/// Extract email addresses from an optional mail_parser Address field.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// First text body, else the first HTML body rendered to text.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Folder handle ───────────────────────────────────────────────────

/// An opened folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderHandle {
    pub path: String,
    pub read_write: bool,
}

impl FolderHandle {
    pub fn new(path: impl Into<String>, read_write: bool) -> Self {
        Self {
            path: path.into(),
            read_write,
        }
    }
}

// ── Processing context ──────────────────────────────────────────────

/// Where the message currently lives, as far as this run knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Addressable at `folder` / `uid`.
    At { folder: String, uid: Uid },
    /// Moved to `folder`; the server did not report the new UID.
    Moved { folder: String },
    /// Deleted or transferred away.
    Removed,
}

/// Per-message scratch state owned by one account processor.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub account: String,
    pub folder: FolderHandle,
    /// Identifier the message was fetched under (the idempotency key).
    pub uid: Uid,
    pub location: Location,
    pub chain_depth: u32,
    pub dry_run: bool,
}

impl ProcessingContext {
    pub fn new(
        account: impl Into<String>,
        folder: FolderHandle,
        uid: Uid,
        chain_depth: u32,
        dry_run: bool,
    ) -> Self {
        let location = Location::At {
            folder: folder.path.clone(),
            uid,
        };
        Self {
            account: account.into(),
            folder,
            uid,
            location,
            chain_depth,
            dry_run,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.location == Location::Removed
    }
}

// ── Action result ───────────────────────────────────────────────────

/// Outcome of one action, surfaced for logs and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Short action label (e.g. "move_to_folder").
    pub action: String,
    pub success: bool,
    pub dry_run: bool,
    /// What the action did (or would do).
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn done(action: &str, detail: impl Into<String>, dry_run: bool) -> Self {
        Self {
            action: action.to_string(),
            success: true,
            dry_run,
            detail: detail.into(),
            error: None,
        }
    }

    pub fn failed(action: &str, detail: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            success: false,
            dry_run: false,
            detail: detail.into(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEWSLETTER: &str = "From: Promo <promo@newsletter.com>\r\n\
        Sender: bulk@mailer.newsletter.com\r\n\
        Reply-To: replies@newsletter.com\r\n\
        To: me@example.com\r\n\
        Cc: team@example.com\r\n\
        Subject: Weekly Digest\r\n\
        Message-ID: <digest-42@newsletter.com>\r\n\
        Date: Mon, 5 Jan 2026 10:00:00 +0000\r\n\
        \r\n\
        This week's highlights.\r\n";

    #[test]
    fn flag_parsing_accepts_variants() {
        assert_eq!("seen".parse::<Flag>(), Ok(Flag::Seen));
        assert_eq!("\\Flagged".parse::<Flag>(), Ok(Flag::Flagged));
        assert_eq!("DRAFT".parse::<Flag>(), Ok(Flag::Draft));
        assert_eq!(
            "important".parse::<Flag>(),
            Err(UnknownFlag("important".into()))
        );
    }

    #[test]
    fn from_rfc822_extracts_headers() {
        let msg = Message::from_rfc822(Uid(42), NEWSLETTER.as_bytes(), BTreeSet::new(), None)
            .unwrap();
        assert_eq!(msg.uid, Uid(42));
        assert_eq!(msg.from, vec!["promo@newsletter.com".to_string()]);
        assert_eq!(msg.sender, vec!["bulk@mailer.newsletter.com".to_string()]);
        assert_eq!(msg.reply_to, vec!["replies@newsletter.com".to_string()]);
        assert_eq!(msg.cc, vec!["team@example.com".to_string()]);
        assert_eq!(msg.subject, "Weekly Digest");
        assert_eq!(msg.message_id.as_deref(), Some("digest-42@newsletter.com"));
        assert!(msg.body.contains("highlights"));
        assert!(!msg.has_attachment);
        assert_eq!(msg.size, NEWSLETTER.len() as u64);
        assert_eq!(msg.received_at.to_rfc3339(), "2026-01-05T10:00:00+00:00");
    }

    #[test]
    fn internal_date_overrides_header_date() {
        let internal = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = Message::from_rfc822(
            Uid(1),
            NEWSLETTER.as_bytes(),
            BTreeSet::new(),
            Some(internal),
        )
        .unwrap();
        assert_eq!(msg.received_at, internal);
    }

    #[test]
    fn address_unions() {
        let msg = Message::from_rfc822(Uid(1), NEWSLETTER.as_bytes(), BTreeSet::new(), None)
            .unwrap();
        let originators: Vec<&str> = msg.originator_addresses().collect();
        assert_eq!(originators.len(), 3);
        let recipients: Vec<&str> = msg.recipient_addresses().collect();
        assert_eq!(recipients, vec!["me@example.com", "team@example.com"]);
    }

    #[test]
    fn html_only_body_is_rendered() {
        let raw = "From: a@b.com\r\nSubject: Hi\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>\r\n";
        let msg = Message::from_rfc822(Uid(3), raw.as_bytes(), BTreeSet::new(), None).unwrap();
        assert!(msg.body.contains("Hello"));
        assert!(msg.body.contains("there"));
        assert!(!msg.body.contains("<p>"));
    }

    #[test]
    fn context_starts_at_fetched_location() {
        let ctx = ProcessingContext::new("work", FolderHandle::new("INBOX", true), Uid(9), 0, false);
        assert_eq!(
            ctx.location,
            Location::At {
                folder: "INBOX".into(),
                uid: Uid(9)
            }
        );
        assert!(!ctx.is_removed());
    }

    #[test]
    fn action_result_serialization_omits_missing_error() {
        let ok = ActionResult::done("mark_read", "marked read", true);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["dryRun"], true);
        assert!(json.get("error").is_none());

        let failed = ActionResult::failed("add_flag", "add flag", "unknown flag 'x'");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("unknown flag 'x'"));
    }
}
