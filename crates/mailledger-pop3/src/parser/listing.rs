//! Parsers for the bodies of STAT, LAST, UIDL and LIST replies and the
//! greeting banner.

use crate::{Error, Result};

/// Extracts the APOP timestamp (`<...>`) from the greeting text.
///
/// Returns `None` if the banner has no timestamp or it contains bytes
/// outside printable ASCII.
#[must_use]
pub fn greeting_timestamp(greeting: &str) -> Option<&str> {
    let start = greeting.find('<')?;
    let len = greeting[start..].find('>')?;
    let timestamp = &greeting[start..=start + len];
    timestamp
        .bytes()
        .all(|b| b.is_ascii_graphic() || b == b' ')
        .then_some(timestamp)
}

/// Parses a STAT body: `<count> <octets>`.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if either number is missing or invalid.
pub fn parse_stat(body: &str) -> Result<(u32, u64)> {
    let mut fields = body.split_ascii_whitespace();
    let count = fields.next().and_then(|f| f.parse().ok());
    let octets = fields.next().and_then(|f| f.parse().ok());
    match (count, octets) {
        (Some(count), Some(octets)) => Ok((count, octets)),
        _ => Err(Error::Malformed(format!("bad STAT reply: {body}"))),
    }
}

/// Parses a LAST body: the highest ordinal already accessed.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if the body does not start with a number.
pub fn parse_last(body: &str) -> Result<u32> {
    body.split_ascii_whitespace()
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::Malformed(format!("bad LAST reply: {body}")))
}

/// Parses a UIDL listing block into `(ordinal, uid)` pairs.
///
/// Lines that do not parse, or name an ordinal outside `1..=count`, are
/// skipped with a warning; a server that garbles one entry should not cost
/// the whole listing.
#[must_use]
pub fn parse_uidl_listing(block: &[u8], count: u32) -> Vec<(u32, String)> {
    let text = String::from_utf8_lossy(block);
    text.lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let num = fields.next().and_then(|f| f.parse::<u32>().ok());
            let uid = fields.next();
            match (num, uid) {
                (Some(num), Some(uid)) if (1..=count).contains(&num) => {
                    Some((num, uid.to_string()))
                }
                _ => {
                    tracing::warn!(line, "invalid UIDL response line");
                    None
                }
            }
        })
        .collect()
}

/// Parses a LIST listing block into `(ordinal, size)` pairs.
///
/// # Errors
///
/// Returns [`Error::Malformed`] on the first line that is not two numbers.
pub fn parse_size_listing(block: &[u8]) -> Result<Vec<(u32, u64)>> {
    let text = String::from_utf8_lossy(block);
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let num = fields.next().and_then(|f| f.parse::<u32>().ok());
            let size = fields.next().and_then(|f| f.parse::<u64>().ok());
            match (num, size) {
                (Some(num), Some(size)) => Ok((num, size)),
                _ => Err(Error::Malformed(format!("bad LIST line: {line}"))),
            }
        })
        .collect()
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
    fn test_greeting_timestamp() {
        assert_eq!(
            greeting_timestamp("POP3 server ready <1896.697170952@dbc.mtview.ca.us>"),
            Some("<1896.697170952@dbc.mtview.ca.us>")
        );
        assert_eq!(greeting_timestamp("Dovecot ready."), None);
        assert_eq!(greeting_timestamp("ready <unterminated"), None);
        assert_eq!(greeting_timestamp("ready <bad\u{7f}stamp>"), None);
    }

    #[test]
    fn test_parse_stat() {
        assert_eq!(parse_stat("3 1500").unwrap(), (3, 1500));
        assert_eq!(parse_stat("0 0").unwrap(), (0, 0));
        assert_eq!(parse_stat("2 320 octets").unwrap(), (2, 320));
        assert!(matches!(parse_stat("three"), Err(Error::Malformed(_))));
        assert!(parse_stat("3").is_err());
    }

    #[test]
    fn test_parse_last() {
        assert_eq!(parse_last("4").unwrap(), 4);
        assert!(parse_last("").is_err());
    }

    #[test]
    fn test_parse_uidl_listing_skips_bad_lines() {
        let block = b"1 aaa\r\n2\r\nx bbb\r\n3 ccc\r\n9 out-of-range\r\n";
        let uids = parse_uidl_listing(block, 3);
        assert_eq!(uids, vec![(1, "aaa".to_string()), (3, "ccc".to_string())]);
    }

    #[test]
    fn test_parse_size_listing() {
        let sizes = parse_size_listing(b"1 120\r\n2 200\r\n").unwrap();
        assert_eq!(sizes, vec![(1, 120), (2, 200)]);
        assert!(parse_size_listing(b"").unwrap().is_empty());
        assert!(matches!(
            parse_size_listing(b"1 120\r\nbogus\r\n"),
            Err(Error::Malformed(_))
        ));
    }
}
