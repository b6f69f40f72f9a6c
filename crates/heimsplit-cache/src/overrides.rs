//! Forced group assignment via the `forceHitTestFlag` parameter.
//!
//! The flag value has the form `<externalKey>-<groupId>;<externalKey>-<groupId>`.
//! Forced values replace whatever the engine computed for the matching
//! experiments before the result is handed on.
//!
//! Items split at their first `-` and non-numeric groups are skipped. Older
//! web clients split at every `-` and coerce the rest to a number, so `key--1`
//! meant `0` there and garbage became `NaN`.

use heimsplit_core::{AssignmentResult, GroupId};
use indexmap::IndexMap;

pub const FORCE_FLAG_PARAM: &str = "forceHitTestFlag";

/// Parses a flag value into external key → group.
///
/// Each item is split at its first `-`, so `key--1` forces group `-1`. Items
/// without a numeric group are skipped.
pub fn parse_force_flag(value: &str) -> IndexMap<String, GroupId> {
    value
        .split(';')
        .filter_map(|item| {
            let (key, group) = item.split_once('-')?;
            let group = group.trim().parse::<GroupId>().ok()?;
            Some((key.trim().to_string(), group))
        })
        .collect()
}

/// Extracts the decoded flag value from a URL or a bare query string.
///
/// Everything after the first `?` is the query; a `#fragment` is ignored. If
/// the parameter appears more than once the last occurrence wins.
pub fn force_flag_from_query(url_or_query: &str) -> Option<String> {
    let query = url_or_query
        .split_once('?')
        .map_or(url_or_query, |(_, query)| query);
    let query = query.split('#').next().unwrap_or_default();

    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == FORCE_FLAG_PARAM)
        .map(|(_, value)| value.into_owned())
        .last()
        .filter(|value| !value.is_empty())
}

/// Maps forced external keys back to experiment names.
///
/// `experiments` yields `(name, external_key)`; only listed experiments can be
/// forced.
pub fn resolve_overrides<'a>(
    experiments: impl IntoIterator<Item = (&'a str, &'a str)>,
    flags: &IndexMap<String, GroupId>,
) -> IndexMap<String, GroupId> {
    experiments
        .into_iter()
        .filter_map(|(name, external_key)| {
            flags
                .get(external_key)
                .map(|&group| (name.to_string(), group))
        })
        .collect()
}

/// Overwrites engine values with forced ones; never adds new experiments.
pub fn apply_overrides(result: &mut AssignmentResult, overrides: &IndexMap<String, GroupId>) {
    for (name, &group) in overrides {
        if let Some(slot) = result.get_mut(name) {
            *slot = group;
        }
    }
}
