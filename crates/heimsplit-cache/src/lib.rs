#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Persisted, incremental experiment assignment.
//!
//! [`AssignmentCache`] reconciles a supplied experiment map against the state
//! stored under a storage key. Experiments whose weight distribution is
//! unchanged keep their previous group; new or changed experiments are resolved
//! again through `heimsplit-strategy`; experiments missing from the map are
//! dropped. The storage medium may fail at any time: every public operation
//! still completes and reports problems to the injected [`Observer`].

pub mod file_store;
pub mod fingerprint;
pub mod overrides;
pub mod session;

use heimsplit_core::{
    AssignmentResult, Diagnostic, ExperimentMap, GroupId, KeyValueStore, LogObserver, Observer,
    PersistedState, Strategy, UNASSIGNED,
};
use heimsplit_strategy::resolve_group_with;
use indexmap::IndexMap;
use rand::{thread_rng, Rng};
use serde::Deserialize;

pub use file_store::FileStore;
pub use fingerprint::fingerprint;

/// Storage key used when the caller does not choose one.
pub const DEFAULT_STORAGE_KEY: &str = "__heimsplit_global__";
/// Suffix of the companion key holding the last supplied definitions.
pub const CONFIG_SUFFIX: &str = ":config";

/// Options for [`AssignmentCache::reconcile`].
#[derive(Debug, Clone, Default)]
pub struct AssignOptions {
    /// Strategy for experiments that do not declare their own.
    pub strategy: Option<Strategy>,
    /// Required by [`Strategy::DeterministicHash`].
    pub user_id: Option<String>,
    /// Isolates independent caches; defaults to [`DEFAULT_STORAGE_KEY`].
    pub storage_key: Option<String>,
}

impl AssignOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = Some(storage_key.into());
        self
    }

    pub fn storage_key(&self) -> &str {
        self.storage_key.as_deref().unwrap_or(DEFAULT_STORAGE_KEY)
    }
}

/// Key of the companion blob holding the raw definitions for `storage_key`.
pub fn config_key(storage_key: &str) -> String {
    format!("{storage_key}{CONFIG_SUFFIX}")
}

/// Renders `"<key>-<group>"` entries joined by `;`.
pub fn format_status<'a>(entries: impl IntoIterator<Item = (&'a str, GroupId)>) -> String {
    entries
        .into_iter()
        .map(|(key, group)| format!("{key}-{group}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Stored payload: current shape first, legacy bare result map second.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPayload {
    Current(PersistedState),
    Legacy(AssignmentResult),
}

/// The part of a persisted definition the status line needs.
#[derive(Deserialize)]
struct DefinitionHeader {
    key: String,
}

/// Assignment cache over a [`KeyValueStore`].
#[derive(Debug)]
pub struct AssignmentCache<S, O = LogObserver> {
    store: S,
    observer: O,
}

impl<S: KeyValueStore> AssignmentCache<S> {
    /// Cache that reports diagnostics through [`LogObserver`].
    pub fn new(store: S) -> Self {
        Self::with_observer(store, LogObserver)
    }
}

impl<S: KeyValueStore, O: Observer> AssignmentCache<S, O> {
    pub fn with_observer(store: S, observer: O) -> Self {
        Self { store, observer }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Reconciles `definitions` against the persisted state and returns the
    /// assignment for every supplied experiment.
    pub fn reconcile(&mut self, definitions: &ExperimentMap, options: &AssignOptions) -> AssignmentResult {
        self.reconcile_with(definitions, options, &mut thread_rng())
    }

    /// Like [`reconcile`](Self::reconcile) with a caller supplied random source.
    pub fn reconcile_with<R: Rng + ?Sized>(
        &mut self,
        definitions: &ExperimentMap,
        options: &AssignOptions,
        rng: &mut R,
    ) -> AssignmentResult {
        let storage_key = options.storage_key();

        if let Err(diagnostic) = self.persist_definitions(storage_key, definitions) {
            self.observer.warn(&diagnostic);
        }

        let prior = self.load_state(storage_key).unwrap_or_else(|diagnostic| {
            self.observer.warn(&diagnostic);
            PersistedState::default()
        });

        let mut next = PersistedState::default();
        let mut kept = 0usize;

        for (name, definition) in definitions {
            let current = fingerprint(&definition.groups);
            let cached = prior
                .result
                .get(name)
                .filter(|_| prior.fingerprints.get(name) == Some(&current));

            let group = match cached {
                Some(&group) => {
                    kept += 1;
                    group
                }
                None => {
                    // per-experiment strategy wins over the batch default
                    let strategy = definition.strategy.as_ref().or(options.strategy.as_ref());
                    resolve_group_with(
                        strategy,
                        &definition.groups,
                        options.user_id.as_deref(),
                        Some(name.as_str()),
                        &self.observer,
                        &mut *rng,
                    )
                }
            };

            next.result.insert(name.clone(), group);
            next.fingerprints.insert(name.clone(), current);
        }

        let dropped = prior
            .result
            .keys()
            .filter(|name| !definitions.contains_key(*name))
            .count();
        log_summary(storage_key, kept, definitions.len() - kept, dropped);

        if let Err(diagnostic) = self.save_state(storage_key, &next) {
            self.observer.warn(&diagnostic);
        }

        next.result
    }

    /// Cached group for `name`, or [`UNASSIGNED`].
    pub fn get_value(&self, name: &str, storage_key: &str) -> GroupId {
        match self.load_state(storage_key) {
            Ok(state) => state.result.get(name).copied().unwrap_or(UNASSIGNED),
            Err(diagnostic) => {
                self.observer.warn(&diagnostic);
                UNASSIGNED
            }
        }
    }

    /// Removes the persisted assignments for `storage_key`.
    ///
    /// The companion definitions blob stays, so the status line keeps its
    /// layout with `-1` values until the next reconciliation.
    pub fn clear_cache(&mut self, storage_key: &str) {
        if let Err(source) = self.store.remove(storage_key) {
            self.observer.warn(&Diagnostic::Storage {
                operation: "remove",
                key: storage_key.to_string(),
                source,
            });
        }
    }

    /// Clears the cache, then reconciles: every experiment is assigned afresh.
    pub fn reset(&mut self, definitions: &ExperimentMap, options: &AssignOptions) -> AssignmentResult {
        self.clear_cache(options.storage_key());
        self.reconcile(definitions, options)
    }

    /// Status line in the order of the last persisted definitions.
    ///
    /// Empty if no definitions were ever persisted for `storage_key`.
    pub fn status_string(&self, storage_key: &str) -> String {
        self.try_status_string(storage_key)
            .unwrap_or_else(|diagnostic| {
                self.observer.warn(&diagnostic);
                String::new()
            })
    }

    fn try_status_string(&self, storage_key: &str) -> Result<String, Diagnostic> {
        let key = config_key(storage_key);
        let Some(raw) = self.read(&key)? else {
            return Ok(String::new());
        };
        let headers: IndexMap<String, DefinitionHeader> = serde_json::from_str(&raw)
            .map_err(|source| Diagnostic::MalformedState { key, source })?;

        let result = self
            .load_state(storage_key)
            .unwrap_or_else(|diagnostic| {
                self.observer.warn(&diagnostic);
                PersistedState::default()
            })
            .result;

        Ok(format_status(headers.iter().map(|(name, header)| {
            (
                header.key.as_str(),
                result.get(name).copied().unwrap_or(UNASSIGNED),
            )
        })))
    }

    fn persist_definitions(
        &mut self,
        storage_key: &str,
        definitions: &ExperimentMap,
    ) -> Result<(), Diagnostic> {
        let key = config_key(storage_key);
        let payload = serde_json::to_string(definitions).map_err(|source| Diagnostic::Serialize {
            key: key.clone(),
            source,
        })?;
        self.write(&key, &payload)
    }

    fn load_state(&self, storage_key: &str) -> Result<PersistedState, Diagnostic> {
        match self.read(storage_key)? {
            Some(raw) if !raw.trim().is_empty() => decode_state(storage_key, &raw),
            _ => Ok(PersistedState::default()),
        }
    }

    fn save_state(&mut self, storage_key: &str, state: &PersistedState) -> Result<(), Diagnostic> {
        let payload = serde_json::to_string(state).map_err(|source| Diagnostic::Serialize {
            key: storage_key.to_string(),
            source,
        })?;
        self.write(storage_key, &payload)
    }

    fn read(&self, key: &str) -> Result<Option<String>, Diagnostic> {
        self.store.get(key).map_err(|source| Diagnostic::Storage {
            operation: "read",
            key: key.to_string(),
            source,
        })
    }

    fn write(&mut self, key: &str, payload: &str) -> Result<(), Diagnostic> {
        self.store.set(key, payload).map_err(|source| Diagnostic::Storage {
            operation: "write",
            key: key.to_string(),
            source,
        })
    }
}

/// Decodes a stored blob. A bare result map predates fingerprints and comes
/// back with none, so all of its entries get recomputed.
fn decode_state(key: &str, raw: &str) -> Result<PersistedState, Diagnostic> {
    match serde_json::from_str::<StoredPayload>(raw) {
        Ok(StoredPayload::Current(state)) => Ok(state),
        Ok(StoredPayload::Legacy(result)) => Ok(PersistedState {
            result,
            fingerprints: IndexMap::new(),
        }),
        Err(source) => Err(Diagnostic::MalformedState {
            key: key.to_string(),
            source,
        }),
    }
}

#[cfg_attr(not(feature = "telemetry"), allow(unused_variables))]
fn log_summary(storage_key: &str, kept: usize, recomputed: usize, dropped: usize) {
    #[cfg(feature = "telemetry")]
    tracing::debug!(storage_key, kept, recomputed, dropped, "reconciled experiment assignments");
}
