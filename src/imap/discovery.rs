//! Mailbox discovery/classification, grounded on
//! `app/imap/mailbox_watcher.py::discover_mailboxes`.

const INCLUDE_SUBSTRINGS: [&str; 3] = ["bulk", "junk", "spam"];
const EXCLUDE_SUBSTRINGS: [&str; 5] = ["sent", "draft", "trash", "deleted", "archive"];

/// Classify and order the watch list from a server's full mailbox listing:
/// always include `INBOX`; include any mailbox containing a bulk/junk/spam
/// substring unless it also contains an excluded substring; preserve
/// first-occurrence order; drop duplicates.
pub fn discover_mailboxes(all_mailboxes: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for name in all_mailboxes {
        let lower = name.to_ascii_lowercase();
        let is_inbox = lower == "inbox";
        let is_included = INCLUDE_SUBSTRINGS.iter().any(|s| lower.contains(s));
        let is_excluded = EXCLUDE_SUBSTRINGS.iter().any(|s| lower.contains(s));

        if (is_inbox || (is_included && !is_excluded)) && seen.insert(lower.clone()) {
            result.push(name.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_includes_inbox() {
        let all = vec!["INBOX".to_owned(), "Archive".to_owned()];
        assert_eq!(discover_mailboxes(&all), vec!["INBOX".to_owned()]);
    }

    #[test]
    fn includes_bulk_junk_spam_unless_also_excluded() {
        let all = vec![
            "INBOX".to_owned(),
            "Bulk Mail".to_owned(),
            "Junk".to_owned(),
            "Spam Archive".to_owned(),
            "Sent Junk".to_owned(),
        ];
        let got = discover_mailboxes(&all);
        assert_eq!(
            got,
            vec!["INBOX".to_owned(), "Bulk Mail".to_owned(), "Junk".to_owned()]
        );
    }

    #[test]
    fn is_case_insensitive_and_dedups_preserving_first_occurrence() {
        let all = vec!["inbox".to_owned(), "INBOX".to_owned(), "BULK".to_owned()];
        assert_eq!(discover_mailboxes(&all), vec!["inbox".to_owned(), "BULK".to_owned()]);
    }

    #[test]
    fn excludes_trash_sent_draft_deleted_archive() {
        let all = vec![
            "Trash".to_owned(),
            "Sent".to_owned(),
            "Drafts".to_owned(),
            "Deleted Items".to_owned(),
            "Archive".to_owned(),
        ];
        assert!(discover_mailboxes(&all).is_empty());
    }
}
