//! Fingerprint of a weight distribution.

use heimsplit_core::Groups;

/// Derives a fingerprint from `groups` only.
///
/// Entries are rendered as `<id>:<weight>`, ordered by the textual form of the
/// id and joined by `|`. Key insertion order never matters, and the strategy of
/// an experiment is not part of the fingerprint.
pub fn fingerprint(groups: &Groups) -> String {
    let mut entries: Vec<(String, u32)> = groups
        .iter()
        .map(|(group, weight)| (group.to_string(), *weight))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .iter()
        .map(|(group, weight)| format!("{group}:{weight}"))
        .collect::<Vec<_>>()
        .join("|")
}
