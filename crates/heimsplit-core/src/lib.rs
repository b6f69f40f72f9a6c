#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Gemeinsame Typen für heimsplit.
//!
//! Ein Experiment besteht aus einem externen Schlüssel, einer Gewichtsverteilung
//! über Gruppen-IDs und optional einer Strategie, die aus dieser Verteilung eine
//! einzelne Gruppe wählt. Die eigentliche Auswahl lebt in `heimsplit-strategy`,
//! das Zwischenspeichern der Zuweisungen in `heimsplit-cache`.

pub mod diagnostic;
pub mod store;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use diagnostic::{Diagnostic, LogObserver, Observer, RecordingObserver};
pub use store::{KeyValueStore, MemoryStore, StoreError};

/// Ganzzahlige Kennung einer Gruppe (Variante).
pub type GroupId = i64;

/// Platzhalter für "nicht zugewiesen" bzw. "noch nicht initialisiert".
pub const UNASSIGNED: GroupId = -1;

/// Gruppen-ID → Gewicht in Prozent (0-100).
///
/// Die natürliche Reihenfolge ist aufsteigend nach Gruppen-ID.
pub type Groups = BTreeMap<GroupId, u32>;

/// Experimentname → Definition, in Einfügereihenfolge.
pub type ExperimentMap = IndexMap<String, ExperimentDefinition>;

/// Experimentname → zugewiesene Gruppe.
pub type AssignmentResult = IndexMap<String, GroupId>;

/// Signatur einer benutzerdefinierten Aufteilungsfunktion.
///
/// Ein `Err` gilt als fehlgeschlagener Aufruf.
pub type CustomFn = dyn Fn(&Groups) -> Result<GroupId, String> + Send + Sync;

/// Von außen injizierte Aufteilungsfunktion.
#[derive(Clone)]
pub struct CustomStrategy(Arc<CustomFn>);

impl CustomStrategy {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Groups) -> Result<GroupId, String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Bequeme Variante für Funktionen, die nicht fehlschlagen können.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(&Groups) -> GroupId + Send + Sync + 'static,
    {
        Self::new(move |groups| Ok(f(groups)))
    }

    pub fn call(&self, groups: &Groups) -> Result<GroupId, String> {
        (self.0)(groups)
    }
}

impl fmt::Debug for CustomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomStrategy(..)")
    }
}

/// Algorithmus, der eine Gewichtsverteilung in genau eine Gruppen-ID überführt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "StrategyName", into = "StrategyName")]
pub enum Strategy {
    /// Gleichverteilter Zufall, gewichtet nach `groups`.
    #[default]
    Uniform,
    /// Stabiler CRC-32-Hash der Nutzer-ID.
    DeterministicHash,
    /// Injizierte Funktion; ungültige Ergebnisse fallen auf `Uniform` zurück.
    Custom(CustomStrategy),
}

/// Persistierbarer Name einer [`Strategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StrategyName {
    #[serde(rename = "random", alias = "uniform")]
    Random,
    #[serde(alias = "deterministic_hash")]
    Crc32,
    Custom,
}

impl From<Strategy> for StrategyName {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Uniform => Self::Random,
            Strategy::DeterministicHash => Self::Crc32,
            Strategy::Custom(_) => Self::Custom,
        }
    }
}

impl TryFrom<StrategyName> for Strategy {
    type Error = String;

    fn try_from(name: StrategyName) -> Result<Self, Self::Error> {
        match name {
            StrategyName::Random => Ok(Self::Uniform),
            StrategyName::Crc32 => Ok(Self::DeterministicHash),
            StrategyName::Custom => {
                Err("custom strategies cannot be restored from serialized data".to_string())
            }
        }
    }
}

impl Strategy {
    /// Kurzname, wie er auch im JSON steht.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "random",
            Self::DeterministicHash => "crc32",
            Self::Custom(_) => "custom",
        }
    }
}

/// Ein benanntes Experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    /// Schlüssel für die Statuszeile, unabhängig vom Namen in der Map.
    #[serde(rename = "key")]
    pub external_key: String,
    pub groups: Groups,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

impl ExperimentDefinition {
    pub fn new(external_key: impl Into<String>, groups: Groups) -> Self {
        Self {
            external_key: external_key.into(),
            groups,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Prüft die Invarianten einer Definition: mindestens eine Gruppe, jedes
    /// Gewicht höchstens 100.
    pub fn validate(&self, name: &str) -> Result<(), Diagnostic> {
        if self.groups.is_empty() {
            return Err(Diagnostic::EmptyGroups {
                experiment: name.to_string(),
            });
        }
        if let Some((&group, &weight)) = self.groups.iter().find(|(_, weight)| **weight > 100) {
            return Err(Diagnostic::WeightOutOfRange {
                experiment: name.to_string(),
                group,
                weight,
            });
        }
        Ok(())
    }
}

/// Dauerhafter Zustand pro Speicher-Schlüssel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub result: AssignmentResult,
    /// Fingerabdruck der `groups` je Experiment zum Zeitpunkt der Zuweisung.
    #[serde(default, alias = "configHashes")]
    pub fingerprints: IndexMap<String, String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn groups(pairs: &[(GroupId, u32)]) -> Groups {
        pairs.iter().copied().collect()
    }

    #[test]
    fn validate_rejects_empty_groups() {
        let def = ExperimentDefinition::new("1001", Groups::new());
        let err = def.validate("hero").unwrap_err();
        assert_eq!(err.code(), "empty_groups");
    }

    #[test]
    fn validate_rejects_weight_over_100() {
        let def = ExperimentDefinition::new("1001", groups(&[(0, 40), (1, 140)]));
        let err = def.validate("hero").unwrap_err();
        assert!(err.to_string().contains("140"));
    }

    #[test]
    fn validate_accepts_under_100_total() {
        let def = ExperimentDefinition::new("1001", groups(&[(0, 10), (1, 20)]));
        assert!(def.validate("hero").is_ok());
    }

    #[test]
    fn custom_strategy_is_callable_and_debuggable() {
        let custom = CustomStrategy::infallible(|g| *g.keys().last().unwrap_or(&UNASSIGNED));
        assert_eq!(custom.call(&groups(&[(0, 50), (7, 50)])), Ok(7));
        assert_eq!(format!("{custom:?}"), "CustomStrategy(..)");
    }
}
