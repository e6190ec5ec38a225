//! Runner label handling.
//!
//! Labels are compared case-insensitively, the same way the job queue treats
//! them. Declared labels keep their original spelling for rendering into the
//! runner's boot configuration.

use std::collections::BTreeSet;

/// Marker label every self-hosted runner advertises implicitly.
pub const SELF_HOSTED: &str = "self-hosted";

/// A normalized, order-independent set of labels used for comparisons.
pub type LabelSet = BTreeSet<String>;

/// Split a delimited label string (`"linux, x64,,gpu"`) into trimmed labels.
///
/// Empty entries are dropped and duplicates removed, keeping first-seen order.
pub fn parse_labels(raw: &str) -> Vec<String> {
    normalize_labels(raw.split(','))
}

/// Trim, drop empties and dedupe (case-insensitively) a list of labels.
pub fn normalize_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = LabelSet::new();
    let mut out = Vec::new();
    for label in labels {
        let label = label.as_ref().trim();
        if label.is_empty() {
            continue;
        }
        if seen.insert(label.to_lowercase()) {
            out.push(label.to_string());
        }
    }
    out
}

/// Build a comparison set from arbitrary labels.
pub fn label_set<I, S>(labels: I) -> LabelSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .map(|l| l.as_ref().trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Labels a pool matches against: its declared labels plus [`SELF_HOSTED`].
pub fn match_label_set(declared: &[String]) -> LabelSet {
    let mut set = label_set(declared);
    set.insert(SELF_HOSTED.to_string());
    set
}
