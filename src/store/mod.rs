//! Durable state store: sqlite-backed persistence for accounts, mailbox
//! cursors, the message delivery/deletion state machine, secrets metadata,
//! alerts, and the Gmail label cache.

pub mod alert_repo;
pub mod label_repo;
pub mod mailbox_repo;
pub mod message_repo;
pub mod models;
pub mod pool;
