//! One-shot resolution for a single session, without the persisted cache.
//!
//! Experiments that declare `groups` are resolved locally. Experiments without
//! `groups` are delegated to an [`ExternalAssigner`], typically an adapter for
//! an analytics vendor that runs its own split. A present force flag bypasses
//! both.

use heimsplit_core::{AssignmentResult, GroupId, Groups, Observer, Strategy, UNASSIGNED};
use heimsplit_strategy::resolve_group;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::format_status;
use crate::overrides::{parse_force_flag, resolve_overrides};

fn unassigned() -> GroupId {
    UNASSIGNED
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefinition {
    #[serde(rename = "key")]
    pub external_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Groups>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Initial value, kept when nothing else decides.
    #[serde(default = "unassigned")]
    pub value: GroupId,
}

impl SessionDefinition {
    pub fn new(external_key: impl Into<String>) -> Self {
        Self {
            external_key: external_key.into(),
            groups: None,
            strategy: None,
            value: UNASSIGNED,
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: Groups) -> Self {
        self.groups = Some(groups);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Source of group ids for experiments that carry no local split.
pub trait ExternalAssigner {
    /// `None` keeps the experiment's initial value.
    fn request_group(&mut self, external_key: &str, user_id: Option<&str>) -> Option<GroupId>;
}

/// Assigner for setups without an external split.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalAssigner;

impl ExternalAssigner for NoExternalAssigner {
    fn request_group(&mut self, _external_key: &str, _user_id: Option<&str>) -> Option<GroupId> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub values: AssignmentResult,
    /// `"<key>-<value>"` per experiment, joined by `;`.
    pub status: String,
}

/// Resolves every experiment once, in definition order.
pub fn resolve_session(
    definitions: &IndexMap<String, SessionDefinition>,
    user_id: Option<&str>,
    force_flag: Option<&str>,
    external: &mut dyn ExternalAssigner,
    observer: &dyn Observer,
) -> SessionOutcome {
    let forced = force_flag.map(|flag| {
        resolve_overrides(
            definitions
                .iter()
                .map(|(name, def)| (name.as_str(), def.external_key.as_str())),
            &parse_force_flag(flag),
        )
    });

    let values: AssignmentResult = definitions
        .iter()
        .map(|(name, def)| {
            let value = match (&forced, &def.groups) {
                (Some(forced), _) => forced.get(name).copied().unwrap_or(def.value),
                (None, Some(groups)) => resolve_group(
                    def.strategy.as_ref(),
                    groups,
                    user_id,
                    Some(name.as_str()),
                    observer,
                ),
                (None, None) => external
                    .request_group(&def.external_key, user_id)
                    .unwrap_or(def.value),
            };
            (name.clone(), value)
        })
        .collect();

    let status = format_status(
        definitions
            .iter()
            .map(|(name, def)| (def.external_key.as_str(), values[name.as_str()])),
    );

    SessionOutcome { values, status }
}
