//! Message header parsing for the TOP listing.
//!
//! Only what the browser shows is extracted: subject, sender and a display
//! date. Missing headers fall back to fixed placeholders.

use std::collections::HashMap;
use std::io::{self, BufRead};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Local};

/// Shown when a message has no Subject header.
pub const NO_SUBJECT: &str = "(No Subject)";

/// Shown when a message has no From header.
pub const NO_FROM: &str = "(No From)";

/// Shown when a message has no Date header.
pub const NO_DATE: &str = "(No Date)";

/// Local-time rendering of a parsed Date header.
const DATE_FORMAT: &str = "%y/%m/%d(%a) %H:%M";

/// Collection of message headers, keyed by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: HashMap<String, Vec<String>>,
}

impl Headers {
    /// Creates a new empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header value.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_lowercase();
        self.headers.entry(name).or_default().push(value.into());
    }

    /// Gets the first value for a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first().map(String::as_str))
    }

    /// Parses headers from raw text. See [`Headers::read_from`].
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut headers = Self::new();
        let mut unfolder = Unfolder::default();
        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            unfolder.push(line, &mut headers);
        }
        unfolder.finish(&mut headers);
        headers
    }

    /// Reads headers from a stream up to the first empty line or EOF.
    ///
    /// Continuation lines (leading space or tab) are unfolded into the
    /// previous header. Bytes that are not UTF-8 are replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from `reader` fails.
    pub fn read_from<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut headers = Self::new();
        let mut unfolder = Unfolder::default();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            unfolder.push(line, &mut headers);
        }
        unfolder.finish(&mut headers);
        Ok(headers)
    }
}

/// Joins folded header lines.
#[derive(Default)]
struct Unfolder {
    current: Option<(String, String)>,
}

impl Unfolder {
    fn push(&mut self, line: &str, headers: &mut Headers) {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = &mut self.current {
                value.push(' ');
                value.push_str(line.trim());
            }
            return;
        }
        self.finish(headers);
        if let Some((name, value)) = line.split_once(':') {
            self.current = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }

    fn finish(&mut self, headers: &mut Headers) {
        if let Some((name, value)) = self.current.take() {
            headers.add(name, value);
        }
    }
}

/// What the browser lists for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeaderSummary {
    /// Message ordinal.
    pub ordinal: u32,
    /// Decoded subject, or [`NO_SUBJECT`].
    pub subject: String,
    /// Decoded sender, or [`NO_FROM`].
    pub from: String,
    /// Display date, or [`NO_DATE`].
    pub date: String,
    /// Size in octets from LIST.
    pub size: u64,
}

impl HeaderSummary {
    /// Builds the summary for one message.
    #[must_use]
    pub fn from_headers(ordinal: u32, size: u64, headers: &Headers) -> Self {
        Self {
            ordinal,
            subject: headers
                .get("Subject")
                .map_or_else(|| NO_SUBJECT.to_string(), decode_encoded_words),
            from: headers
                .get("From")
                .map_or_else(|| NO_FROM.to_string(), decode_encoded_words),
            date: display_date(headers.get("Date")),
            size,
        }
    }

    /// Size rendered with binary units: `512B`, `1.5KB`, `2.25MB`.
    #[must_use]
    pub fn display_size(&self) -> String {
        human_size(self.size)
    }
}

/// Renders a byte count the way the message list shows it.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_size(size: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    if size < KB {
        format!("{size}B")
    } else if size < MB {
        format!("{:.1}KB", size as f64 / KB as f64)
    } else if size < GB {
        format!("{:.2}MB", size as f64 / MB as f64)
    } else {
        format!("{:.2}GB", size as f64 / GB as f64)
    }
}

/// Parsed date in local time, else the raw header, else [`NO_DATE`].
#[must_use]
pub fn display_date(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return NO_DATE.to_string();
    };
    parse_date(raw).map_or_else(
        || raw.to_string(),
        |date| date.with_timezone(&Local).format(DATE_FORMAT).to_string(),
    )
}

/// Parses an RFC 2822 date, ignoring a trailing zone comment like `(UTC)`.
fn parse_date(raw: &str) -> Option<DateTime<chrono::FixedOffset>> {
    let trimmed = raw.trim();
    let without_comment = match trimmed.rfind('(') {
        Some(pos) if trimmed.ends_with(')') => trimmed[..pos].trim_end(),
        _ => trimmed,
    };
    DateTime::parse_from_rfc2822(without_comment).ok()
}

/// Decodes RFC 2047 encoded words in a header value.
///
/// Whitespace between two adjacent encoded words is dropped. Words in an
/// unknown charset or encoding are left as they are.
#[must_use]
pub fn decode_encoded_words(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        if let Some((decoded, consumed)) = decode_word(candidate) {
            if !(after_word && before.trim().is_empty()) {
                out.push_str(before);
            }
            out.push_str(&decoded);
            rest = &candidate[consumed..];
            after_word = true;
        } else {
            out.push_str(before);
            out.push_str("=?");
            rest = &candidate[2..];
            after_word = false;
        }
    }
    out.push_str(rest);
    out
}

/// Decodes one `=?charset?enc?text?=` word at the start of `s`.
///
/// Returns the decoded text and the number of bytes consumed.
fn decode_word(s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("=?")?;
    let (charset, after) = inner.split_once('?')?;
    let (encoding, after) = after.split_once('?')?;
    let end = after.find("?=")?;
    let text = &after[..end];
    if [charset, encoding, text]
        .iter()
        .any(|part| part.contains(char::is_whitespace))
    {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => STANDARD.decode(text).ok()?,
        "Q" | "q" => decode_q(text)?,
        _ => return None,
    };
    // RFC 2231 language suffix: `utf-8*en`.
    let charset = charset.split('*').next().unwrap_or(charset);
    let decoded = decode_charset(charset, &bytes)?;
    let consumed = 2 + charset_len(inner) + encoding.len() + 1 + end + 2;
    Some((decoded, consumed))
}

/// Length of the charset field including its trailing `?`.
fn charset_len(inner: &str) -> usize {
    inner.find('?').map_or(0, |pos| pos + 1)
}

fn decode_q(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = bytes.next()?;
                let lo = bytes.next()?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
            }
            other => out.push(other),
        }
    }
    Some(out)
}

fn decode_charset(charset: &str, bytes: &[u8]) -> Option<String> {
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "us-ascii" => Some(String::from_utf8_lossy(bytes).into_owned()),
        "iso-8859-1" | "latin1" | "iso_8859-1" => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_parse_unfolds() {
        let text = concat!(
            "From: sender@example.com\r\n",
            "Subject: A long\r\n",
            "\tsubject line\r\n",
            "\r\n",
            "Body: not a header\r\n"
        );
        let headers = Headers::parse(text);
        assert_eq!(headers.get("from"), Some("sender@example.com"));
        assert_eq!(headers.get("Subject"), Some("A long subject line"));
        assert_eq!(headers.get("Body"), None);
    }

    #[test]
    fn test_read_from_stream() {
        let raw = b"Subject: hi\r\nFrom: a@b\r\n\r\n";
        let headers = Headers::read_from(&mut &raw[..]).unwrap();
        assert_eq!(headers.get("subject"), Some("hi"));
        assert_eq!(headers.get("from"), Some("a@b"));
    }

    #[test]
    fn test_summary_defaults() {
        let summary = HeaderSummary::from_headers(4, 10, &Headers::new());
        assert_eq!(summary.ordinal, 4);
        assert_eq!(summary.subject, NO_SUBJECT);
        assert_eq!(summary.from, NO_FROM);
        assert_eq!(summary.date, NO_DATE);
    }

    #[test]
    fn test_display_date_parsed_is_local_time() {
        let raw = "Tue, 1 Jul 2003 10:52:37 +0200";
        let expected = DateTime::parse_from_rfc2822(raw)
            .unwrap()
            .with_timezone(&Local)
            .format(DATE_FORMAT)
            .to_string();
        assert_eq!(display_date(Some(raw)), expected);
        assert_eq!(display_date(Some("Tue, 1 Jul 2003 10:52:37 +0200 (CEST)")), expected);
    }

    #[test]
    fn test_display_date_falls_back_to_raw() {
        assert_eq!(display_date(Some("sometime last week")), "sometime last week");
        assert_eq!(display_date(None), NO_DATE);
    }

    #[test]
    fn test_decode_encoded_words() {
        assert_eq!(decode_encoded_words("plain text"), "plain text");
        assert_eq!(decode_encoded_words("=?utf-8?B?SMOpbGxv?="), "Héllo");
        assert_eq!(decode_encoded_words("=?UTF-8?Q?H=C3=A9llo_there?="), "Héllo there");
        assert_eq!(
            decode_encoded_words("=?utf-8?Q?a?= =?utf-8?Q?b?= c"),
            "ab c"
        );
        assert_eq!(
            decode_encoded_words("=?iso-8859-1?Q?Andr=E9?= <andre@example.com>"),
            "André <andre@example.com>"
        );
        assert_eq!(
            decode_encoded_words("=?koi8-r?B?5MXO?= x"),
            "=?koi8-r?B?5MXO?= x"
        );
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1536), "1.5KB");
        assert_eq!(human_size(5 * 1024 * 1024 / 2), "2.50MB");
        assert_eq!(human_size(3 << 30), "3.00GB");
    }
}
