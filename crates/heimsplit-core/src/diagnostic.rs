//! Fehlerklassen und Beobachter.
//!
//! Keine öffentliche Operation von heimsplit gibt einen Fehler nach außen. Intern
//! entstehen [`Diagnostic`]-Werte, die an einen injizierten [`Observer`] gehen,
//! während der Aufrufer einen sicheren Standardwert erhält.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::store::StoreError;
use crate::GroupId;

#[derive(Debug, Error)]
pub enum Diagnostic {
    #[error("CRC32 strategy requires userId for experiment {experiment}")]
    MissingUserId { experiment: String },
    #[error("experiment {experiment} declares no groups")]
    EmptyGroups { experiment: String },
    #[error("weight {weight} of group {group} in experiment {experiment} exceeds 100")]
    WeightOutOfRange {
        experiment: String,
        group: GroupId,
        weight: u32,
    },
    #[error("Custom strategy returned invalid groupId {group} for experiment {experiment}")]
    InvalidCustomGroup { experiment: String, group: GroupId },
    #[error("Error executing custom strategy for experiment {experiment}: {reason}")]
    CustomStrategyFailed { experiment: String, reason: String },
    #[error("storage {operation} failed for {key}: {source}")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("malformed persisted data in {key}: {source}")]
    MalformedState {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize data for {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Diagnostic {
    /// Stabiler, maschinenlesbarer Code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingUserId { .. } => "missing_user_id",
            Self::EmptyGroups { .. } => "empty_groups",
            Self::WeightOutOfRange { .. } => "weight_out_of_range",
            Self::InvalidCustomGroup { .. } => "invalid_custom_group",
            Self::CustomStrategyFailed { .. } => "custom_strategy_failed",
            Self::Storage { .. } => "storage",
            Self::MalformedState { .. } => "malformed_state",
            Self::Serialize { .. } => "serialize",
        }
    }
}

/// Empfänger für Diagnosen, die nicht als Fehler zurückgegeben werden.
pub trait Observer {
    fn warn(&self, diagnostic: &Diagnostic);
}

impl<O: Observer + ?Sized> Observer for &O {
    fn warn(&self, diagnostic: &Diagnostic) {
        (**self).warn(diagnostic);
    }
}

/// Standard-Beobachter: schreibt Warnungen ins Log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn warn(&self, diagnostic: &Diagnostic) {
        #[cfg(feature = "telemetry")]
        tracing::warn!(code = diagnostic.code(), "{diagnostic}");
        #[cfg(not(feature = "telemetry"))]
        eprintln!("[heimsplit] [WARN] {diagnostic}");
    }
}

/// Sammelt Diagnosen als `(code, message)`, z. B. für Tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(&'static str, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.records().into_iter().map(|(code, _)| code).collect()
    }

    /// `true`, wenn eine Meldung `needle` enthält.
    pub fn mentions(&self, needle: &str) -> bool {
        self.records().iter().any(|(_, message)| message.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl Observer for RecordingObserver {
    fn warn(&self, diagnostic: &Diagnostic) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((diagnostic.code(), diagnostic.to_string()));
    }
}
