//! Row types for the state store tables, explicit and nullable where the
//! schema allows NULL — no dynamically typed rows.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Fetched,
    Inserting,
    Inserted,
    FailedRetry,
    FailedPerm,
}

impl MessageState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "FETCHED",
            Self::Inserting => "INSERTING",
            Self::Inserted => "INSERTED",
            Self::FailedRetry => "FAILED_RETRY",
            Self::FailedPerm => "FAILED_PERM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FETCHED" => Some(Self::Fetched),
            "INSERTING" => Some(Self::Inserting),
            "INSERTED" => Some(Self::Inserted),
            "FAILED_RETRY" => Some(Self::FailedRetry),
            "FAILED_PERM" => Some(Self::FailedPerm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailboxRow {
    pub account_id: i64,
    pub name: String,
    pub uidvalidity: i64,
    pub last_seen_uid: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub account_id: i64,
    pub mailbox_name: String,
    pub uidvalidity: i64,
    pub uid: i64,
    pub message_id: Option<String>,
    pub rfc822_sha256: String,
    pub imap_internaldate: Option<String>,
    pub imap_flags_json: String,
    pub state: MessageState,
    pub attempt_count: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub gmail_message_id: Option<String>,
    pub gmail_thread_id: Option<String>,
    pub yahoo_deleted_at: Option<DateTime<Utc>>,
    pub yahoo_delete_attempt_count: i64,
    pub yahoo_delete_next_attempt_at: Option<DateTime<Utc>>,
    pub yahoo_delete_last_error: Option<String>,
}

/// A newly fetched message as captured by the watcher, before any row exists.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub account_id: i64,
    pub mailbox_name: String,
    pub uidvalidity: i64,
    pub uid: i64,
    pub message_id: Option<String>,
    pub rfc822_sha256: String,
    pub imap_internaldate: Option<String>,
    pub imap_flags_json: String,
}
