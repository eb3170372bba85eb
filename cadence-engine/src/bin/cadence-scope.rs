//! Inspects a Cadence database file: goals, completions, the pending
//! operation queue, and the sync cursor, with basic consistency checks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use cadence_engine::LocalStore;

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-cadence-db>", args[0]);
        eprintln!("\nExample: {} ./cadence.db", args[0]);
        std::process::exit(1);
    }

    let db_path = PathBuf::from(&args[1]);
    if !db_path.exists() {
        eprintln!("Error: File '{}' does not exist", db_path.display());
        std::process::exit(1);
    }

    let store = match LocalStore::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening '{}': {e}", db_path.display());
            std::process::exit(1);
        }
    };

    println!("CadenceScope - Local Store Inspector");
    println!("====================================");
    println!("File: {}", db_path.display());
    println!();

    println!("Goals:");
    println!("------");
    match store.list_all_goals() {
        Ok(goals) => {
            let active = goals.iter().filter(|g| !g.is_archived()).count();
            println!("  Total: {} ({} active)", goals.len(), active);
            println!();

            let mut positions_seen: BTreeMap<i64, usize> = BTreeMap::new();
            for goal in &goals {
                let state = if goal.is_archived() { "archived" } else { "active" };
                println!("  [{}] {} ({state})", goal.position, goal.name);
                println!("    Id: {}", goal.id);
                if let Some(count) = goal.target_count {
                    let period = goal
                        .target_period
                        .map(|p| format!("{p:?}").to_lowercase())
                        .unwrap_or_else(|| "unset period".to_string());
                    println!("    Target: {count} per {period}");
                }
                if !goal.is_archived() {
                    *positions_seen.entry(goal.position).or_default() += 1;
                }
            }
            let duplicates: Vec<i64> = positions_seen
                .iter()
                .filter(|(_, count)| **count > 1)
                .map(|(position, _)| *position)
                .collect();
            if duplicates.is_empty() {
                println!("  ✅ Active positions are unique");
            } else {
                println!("  ⚠️  Duplicate active positions: {duplicates:?}");
            }
        }
        Err(e) => println!("  Error reading goals: {e}"),
    }

    println!();
    println!("Completions:");
    println!("------------");
    match store.list_all_completions() {
        Ok(completions) => {
            println!("  Total: {}", completions.len());
            let mut pairs_seen: BTreeMap<(String, String), usize> = BTreeMap::new();
            for completion in &completions {
                *pairs_seen
                    .entry((completion.goal_id.clone(), completion.date.to_string()))
                    .or_default() += 1;
            }
            let duplicates = pairs_seen.values().filter(|count| **count > 1).count();
            if duplicates == 0 {
                println!("  ✅ One completion per (goal, date) pair");
            } else {
                println!("  ❌ {duplicates} (goal, date) pairs appear more than once");
            }
        }
        Err(e) => println!("  Error reading completions: {e}"),
    }

    println!();
    println!("Operation Queue:");
    println!("----------------");
    match store.drain_operations_ordered() {
        Ok(ops) => {
            println!("  Pending: {}", ops.len());
            for (index, op) in ops.iter().enumerate() {
                println!("  {index}: {} on {}", op.kind, op.entity_id);
                println!("     Queued at: {}", op.timestamp);
                if op.retry_count > 0 {
                    println!("     ⚠️  Retries so far: {}", op.retry_count);
                }
            }
        }
        Err(e) => println!("  Error reading queue: {e}"),
    }

    println!();
    println!("Sync Cursor:");
    println!("------------");
    match store.last_synced_at() {
        Ok(Some(at)) => println!("  Last synced at: {at}"),
        Ok(None) => println!("  Never synced (next sync uploads everything)"),
        Err(e) => println!("  Error reading cursor: {e}"),
    }
}
