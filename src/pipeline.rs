//! Message pipeline: trace-header injection with SHA256 integrity check,
//! label-set computation, and threading-header extraction. Grounded on
//! `app/sync/message_pipeline.py`.

use mailparse::MailHeaderMap;
use sha2::{Digest, Sha256};

use crate::errors::{PipelineError, PipelineResult};

pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Locate the header/body separator, preferring CRLF CRLF over LF LF.
fn find_separator(raw: &[u8]) -> Option<(usize, &'static [u8], &'static [u8])> {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        return Some((pos, b"\r\n", b"\r\n\r\n"));
    }
    if let Some(pos) = find_subslice(raw, b"\n\n") {
        return Some((pos, b"\n", b"\n\n"));
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Append the five `X-Y2G-*` trace headers immediately before the
/// header/body separator, leaving the body byte-for-byte unchanged.
fn add_trace_headers(
    raw: &[u8],
    mailbox_name: &str,
    uidvalidity: u32,
    uid: u32,
    sha256_hex: &str,
) -> PipelineResult<Vec<u8>> {
    let (pos, sep, marker) = find_separator(raw).ok_or(PipelineError::MissingSeparator)?;
    let header_block = &raw[..pos];
    let body = &raw[pos + marker.len()..];

    let extra_lines = [
        "X-Y2G-Source: yahoo".to_owned(),
        format!("X-Y2G-Mailbox: {mailbox_name}"),
        format!("X-Y2G-UIDValidity: {uidvalidity}"),
        format!("X-Y2G-UID: {uid}"),
        format!("X-Y2G-RFC822-SHA256: {sha256_hex}"),
    ];

    let mut out = Vec::with_capacity(raw.len() + 256);
    out.extend_from_slice(header_block);
    for line in &extra_lines {
        out.extend_from_slice(sep);
        out.extend_from_slice(line.as_bytes());
    }
    out.extend_from_slice(marker);
    out.extend_from_slice(body);
    Ok(out)
}

/// Verify the captured hash against the current bytes, then inject trace
/// headers. The caller's `sha256_hex` was computed at fetch time; a mismatch
/// means a stale row got paired with a re-fetched body.
pub fn prepare_raw_message(
    raw: &[u8],
    mailbox_name: &str,
    uidvalidity: u32,
    uid: u32,
    expected_sha256_hex: &str,
) -> PipelineResult<Vec<u8>> {
    if sha256_hex(raw) != expected_sha256_hex {
        return Err(PipelineError::HashMismatch);
    }
    add_trace_headers(raw, mailbox_name, uidvalidity, uid, expected_sha256_hex)
}

/// Best-effort `Message-ID` extraction: first `<...>` substring in the header
/// value, else the trimmed value, else `None`. Never fails on malformed mail.
pub fn extract_message_id(raw: &[u8]) -> Option<String> {
    let (parsed, _) = mailparse::parse_headers(raw).ok()?;
    let value = parsed.get_first_value("Message-ID")?;
    Some(extract_angle_bracketed(&value).unwrap_or_else(|| value.trim().to_owned()))
}

pub fn extract_in_reply_to(raw: &[u8]) -> Option<String> {
    let (parsed, _) = mailparse::parse_headers(raw).ok()?;
    let value = parsed.get_first_value("In-Reply-To")?;
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_owned()) }
}

/// `References`, split on whitespace, angle-bracketed tokens preserved.
pub fn extract_references(raw: &[u8]) -> Vec<String> {
    let Some((parsed, _)) = mailparse::parse_headers(raw).ok() else {
        return Vec::new();
    };
    let Some(value) = parsed.get_first_value("References") else {
        return Vec::new();
    };
    value
        .split_whitespace()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn extract_angle_bracketed(value: &str) -> Option<String> {
    let start = value.find('<')?;
    let end = value[start..].find('>')? + start;
    Some(value[start..=end].to_owned())
}

/// Whether the captured IMAP flags contain the exact token `\Seen`.
pub fn has_seen_flag(imap_flags_json: &str) -> bool {
    serde_json::from_str::<Vec<String>>(imap_flags_json)
        .map(|flags| flags.iter().any(|f| f == "\\Seen"))
        .unwrap_or(false)
}

/// Custom/INBOX/UNREAD inclusion decisions, independent of label-id resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPlan {
    pub include_custom: bool,
    pub include_inbox: bool,
    pub include_unread: bool,
}

pub fn compute_label_plan(
    custom_label_configured: bool,
    deliver_to_inbox: bool,
    imap_flags_json: &str,
) -> LabelPlan {
    LabelPlan {
        include_custom: custom_label_configured,
        include_inbox: deliver_to_inbox,
        include_unread: !has_seen_flag(imap_flags_json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_raw_message_injects_five_headers_and_preserves_body() {
        let raw = b"Subject: hi\r\n\r\nBody text";
        let hash = sha256_hex(raw);
        let prepared = prepare_raw_message(raw, "INBOX", 100, 42, &hash).unwrap();
        let text = String::from_utf8(prepared).unwrap();

        assert!(text.contains("X-Y2G-Source: yahoo"));
        assert!(text.contains("X-Y2G-Mailbox: INBOX"));
        assert!(text.contains("X-Y2G-UIDValidity: 100"));
        assert!(text.contains("X-Y2G-UID: 42"));
        assert!(text.contains(&format!("X-Y2G-RFC822-SHA256: {hash}")));
        assert!(text.ends_with("\r\n\r\nBody text"));
    }

    #[test]
    fn prepare_raw_message_falls_back_to_lf_separator() {
        let raw = b"Subject: hi\n\nBody text";
        let hash = sha256_hex(raw);
        let prepared = prepare_raw_message(raw, "INBOX", 1, 1, &hash).unwrap();
        let text = String::from_utf8(prepared).unwrap();
        assert!(text.ends_with("\n\nBody text"));
    }

    #[test]
    fn prepare_raw_message_fails_on_missing_separator() {
        let raw = b"Subject: hi only headers no body marker";
        let hash = sha256_hex(raw);
        assert!(matches!(
            prepare_raw_message(raw, "INBOX", 1, 1, &hash),
            Err(PipelineError::MissingSeparator)
        ));
    }

    #[test]
    fn prepare_raw_message_fails_on_hash_mismatch() {
        let raw = b"Subject: hi\r\n\r\nBody";
        let result = prepare_raw_message(raw, "INBOX", 1, 1, "0000deadbeef");
        assert!(matches!(result, Err(PipelineError::HashMismatch)));
    }

    #[test]
    fn extract_message_id_prefers_angle_bracket_substring() {
        let raw = b"Message-ID: garbage <abc123@host> trailing\r\n\r\nBody";
        assert_eq!(extract_message_id(raw), Some("<abc123@host>".to_owned()));
    }

    #[test]
    fn extract_message_id_falls_back_to_trimmed_value() {
        let raw = b"Message-ID:   bare-id-no-brackets   \r\n\r\nBody";
        assert_eq!(extract_message_id(raw), Some("bare-id-no-brackets".to_owned()));
    }

    #[test]
    fn extract_references_splits_on_whitespace() {
        let raw = b"References: <a@x> <b@y>\r\n\r\nBody";
        assert_eq!(
            extract_references(raw),
            vec!["<a@x>".to_owned(), "<b@y>".to_owned()]
        );
    }

    #[test]
    fn label_plan_omits_unread_when_seen_flag_present() {
        let plan = compute_label_plan(true, true, r#"["\\Seen"]"#);
        assert!(!plan.include_unread);
        assert!(plan.include_custom);
        assert!(plan.include_inbox);
    }

    #[test]
    fn label_plan_includes_unread_when_seen_flag_absent() {
        let plan = compute_label_plan(true, true, "[]");
        assert!(plan.include_unread);
    }
}
