//! Destination delivery adapter: Gmail REST client plus the label cache.

pub mod client;
pub mod labels;
