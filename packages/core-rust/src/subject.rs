//! Dot-separated subject names and wildcard filters.
//!
//! Filters follow the NATS convention: `*` matches exactly one token and
//! `>` matches one or more trailing tokens. A filter with `>` anywhere but
//! the last position never matches.

/// Returns `true` if `subject` is selected by `filter`.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    if filter.is_empty() || subject.is_empty() {
        return false;
    }

    let mut filter_tokens = filter.split('.').peekable();
    let mut subject_tokens = subject.split('.');

    while let Some(expected) = filter_tokens.next() {
        if expected == ">" {
            return filter_tokens.peek().is_none() && subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(token) if expected == "*" || expected == token => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

/// Builds the notification subject for an object kind under `prefix`.
///
/// The kind is lower-cased so `Network` and `network` publish to the same
/// subject. An empty prefix yields the bare kind.
#[must_use]
pub fn subject_for_kind(prefix: &str, kind: &str) -> String {
    let kind = kind.to_ascii_lowercase();
    if prefix.is_empty() {
        kind
    } else {
        format!("{prefix}.{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filter_matches_exact_subject_only() {
        assert!(subject_matches("events.network", "events.network"));
        assert!(!subject_matches("events.network", "events.volume"));
        assert!(!subject_matches("events.network", "events.network.extra"));
        assert!(!subject_matches("events.network.extra", "events.network"));
    }

    #[test]
    fn star_matches_single_token() {
        assert!(subject_matches("events.*", "events.network"));
        assert!(!subject_matches("events.*", "events"));
        assert!(!subject_matches("events.*", "events.network.created"));
        assert!(subject_matches("*.network", "events.network"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_tokens() {
        assert!(subject_matches("events.>", "events.network"));
        assert!(subject_matches("events.>", "events.network.created"));
        assert!(!subject_matches("events.>", "events"));
        assert!(!subject_matches("events.>.created", "events.network.created"));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!subject_matches("", "events"));
        assert!(!subject_matches("events", ""));
    }

    #[test]
    fn subject_for_kind_lowercases_and_prefixes() {
        assert_eq!(subject_for_kind("events", "Network"), "events.network");
        assert_eq!(subject_for_kind("", "Volume"), "volume");
    }
}
