//! Reconciles a small experiment map twice against an in-memory store and
//! prints both results plus the status line.
//!
//! Run with: cargo run -p heimsplit-cache --example assign

use heimsplit_cache::{AssignOptions, AssignmentCache, DEFAULT_STORAGE_KEY};
use heimsplit_core::{ExperimentDefinition, ExperimentMap, MemoryStore, Strategy};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut definitions = ExperimentMap::new();
    definitions.insert(
        "hero_banner".to_string(),
        ExperimentDefinition::new("1001", [(0, 50), (1, 50)].into_iter().collect()),
    );
    definitions.insert(
        "checkout_cta".to_string(),
        ExperimentDefinition::new("1002", [(0, 20), (1, 80)].into_iter().collect())
            .with_strategy(Strategy::DeterministicHash),
    );

    let options = AssignOptions::new().with_user_id("visitor-42");
    let mut cache = AssignmentCache::new(MemoryStore::new());

    let first = cache.reconcile(&definitions, &options);
    println!("first:  {}", serde_json::to_string(&first)?);

    let second = cache.reconcile(&definitions, &options);
    println!("second: {}", serde_json::to_string(&second)?);

    println!("status: {}", cache.status_string(DEFAULT_STORAGE_KEY));
    Ok(())
}
