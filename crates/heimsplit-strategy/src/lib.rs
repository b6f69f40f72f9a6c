#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Aufteilungsstrategien für Experimente.
//!
//! Jede Strategie überführt eine Gewichtsverteilung ([`Groups`]) in genau eine
//! Gruppen-ID. Es gibt drei Varianten: gewichteter Zufall, ein stabiler
//! CRC-32-Hash der Nutzer-ID und eine injizierte Funktion. Keine Funktion hier
//! gibt einen Fehler nach außen; Probleme gehen als [`Diagnostic`] an den
//! übergebenen [`Observer`].

use std::panic::{self, AssertUnwindSafe};

use heimsplit_core::{CustomStrategy, Diagnostic, GroupId, Groups, Observer, Strategy, UNASSIGNED};
use rand::prelude::*;

/// Reflektiertes Standard-Polynom von CRC-32 (IEEE 802.3).
const CRC32_POLY: u32 = 0xEDB8_8320;

/// Obergrenze (exklusiv) eines Zufallswurfs.
pub const DRAW_RANGE: f64 = 100.0;

const UNKNOWN_EXPERIMENT: &str = "unknown";

/// Wählt die Gruppe für einen gegebenen Wurf `draw` aus `[0, 100)`.
///
/// Die Gruppen werden in aufsteigender ID-Reihenfolge kumuliert; die erste
/// Gruppe, deren kumuliertes Gewicht den Wurf übersteigt, gewinnt. Liegt der
/// Wurf hinter der Gesamtsumme (Summe < 100), gewinnt die numerisch größte ID.
pub fn pick_by_draw(groups: &Groups, draw: f64) -> GroupId {
    let mut accumulated = 0.0;
    for (&group, &weight) in groups {
        accumulated += f64::from(weight);
        if draw < accumulated {
            return group;
        }
    }
    largest_group(groups)
}

/// Gewichteter Zufall mit übergebenem Zufallsgenerator.
pub fn weighted_random_pick_with<R: Rng + ?Sized>(groups: &Groups, rng: &mut R) -> GroupId {
    pick_by_draw(groups, rng.gen_range(0.0..DRAW_RANGE))
}

/// Gewichteter Zufall mit `thread_rng()`.
///
/// Für eine leere Verteilung ergibt sich [`UNASSIGNED`].
pub fn weighted_random_pick(groups: &Groups) -> GroupId {
    weighted_random_pick_with(groups, &mut thread_rng())
}

/// CRC-32 ohne Tabelle, bitweise über die Bytes.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (CRC32_POLY & mask);
        }
    }
    !crc
}

/// Eimer `0..100` für eine Nutzer-ID.
///
/// Gehasht werden die UTF-8-Bytes der ID; für reine ASCII-IDs ist das
/// identisch mit einem Hash über die Zeichencodes.
pub fn hash_bucket(user_id: &str) -> u32 {
    crc32(user_id.as_bytes()) % 100
}

/// Wählt die Gruppe für einen Eimer aus `0..100`.
///
/// Entspricht `bucket / 100 < Σ weight / 100`, aber ganzzahlig gerechnet.
pub fn pick_by_bucket(groups: &Groups, bucket: u32) -> GroupId {
    let mut accumulated: u64 = 0;
    for (&group, &weight) in groups {
        accumulated += u64::from(weight);
        if u64::from(bucket) < accumulated {
            return group;
        }
    }
    largest_group(groups)
}

/// Deterministische Auswahl anhand der Nutzer-ID.
///
/// Gleiche ID und gleiche Gruppen liefern immer dieselbe Gruppe. Eine leere ID
/// ergibt [`UNASSIGNED`].
pub fn deterministic_hash_pick(user_id: &str, groups: &Groups) -> GroupId {
    if user_id.is_empty() {
        return UNASSIGNED;
    }
    pick_by_bucket(groups, hash_bucket(user_id))
}

/// Löst `strategy` für ein Experiment auf (Standard: [`Strategy::Uniform`]).
///
/// * `DeterministicHash` ohne Nutzer-ID → [`UNASSIGNED`] plus Warnung.
/// * `Custom`, das fehlschlägt oder eine unbekannte ID liefert → Warnung und
///   Rückfall auf gewichteten Zufall.
pub fn resolve_group(
    strategy: Option<&Strategy>,
    groups: &Groups,
    user_id: Option<&str>,
    experiment: Option<&str>,
    observer: &dyn Observer,
) -> GroupId {
    resolve_group_with(
        strategy,
        groups,
        user_id,
        experiment,
        observer,
        &mut thread_rng(),
    )
}

/// Wie [`resolve_group`], aber mit übergebenem Zufallsgenerator.
pub fn resolve_group_with<R: Rng + ?Sized>(
    strategy: Option<&Strategy>,
    groups: &Groups,
    user_id: Option<&str>,
    experiment: Option<&str>,
    observer: &dyn Observer,
    rng: &mut R,
) -> GroupId {
    let experiment = experiment.unwrap_or(UNKNOWN_EXPERIMENT);
    try_resolve(strategy, groups, user_id, experiment, observer, rng).unwrap_or_else(|diagnostic| {
        observer.warn(&diagnostic);
        UNASSIGNED
    })
}

fn try_resolve<R: Rng + ?Sized>(
    strategy: Option<&Strategy>,
    groups: &Groups,
    user_id: Option<&str>,
    experiment: &str,
    observer: &dyn Observer,
    rng: &mut R,
) -> Result<GroupId, Diagnostic> {
    if groups.is_empty() {
        return Err(Diagnostic::EmptyGroups {
            experiment: experiment.to_string(),
        });
    }

    match strategy.unwrap_or(&Strategy::Uniform) {
        Strategy::Uniform => Ok(weighted_random_pick_with(groups, rng)),
        Strategy::DeterministicHash => match user_id.filter(|id| !id.is_empty()) {
            Some(user_id) => Ok(deterministic_hash_pick(user_id, groups)),
            None => Err(Diagnostic::MissingUserId {
                experiment: experiment.to_string(),
            }),
        },
        Strategy::Custom(custom) => match run_custom(custom, groups, experiment) {
            Ok(group) => Ok(group),
            Err(diagnostic) => {
                observer.warn(&diagnostic);
                Ok(weighted_random_pick_with(groups, rng))
            }
        },
    }
}

fn run_custom(
    custom: &CustomStrategy,
    groups: &Groups,
    experiment: &str,
) -> Result<GroupId, Diagnostic> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| custom.call(groups)))
        .unwrap_or_else(|payload| Err(panic_reason(payload.as_ref())));

    match outcome {
        Ok(group) if groups.contains_key(&group) => Ok(group),
        Ok(group) => Err(Diagnostic::InvalidCustomGroup {
            experiment: experiment.to_string(),
            group,
        }),
        Err(reason) => Err(Diagnostic::CustomStrategyFailed {
            experiment: experiment.to_string(),
            reason,
        }),
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

fn largest_group(groups: &Groups) -> GroupId {
    groups.keys().next_back().copied().unwrap_or(UNASSIGNED)
}
