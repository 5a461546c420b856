//! Source IMAP adapter: session transport plus mailbox discovery.

pub mod discovery;
pub mod session;
