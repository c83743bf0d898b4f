//! `vigil reconcile`: one startup reconciliation pass over a JSON exit history.
//!
//! Prints a JSON summary to stdout; logs go to stderr and the log file.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use vigil_core::reconcile::JsonExitHistory;
use vigil_core::{ReconcileOutcome, StorageConfig};
use vigil_protocol::ReportCategory;

use crate::error::AgentError;
use crate::open_engine;

pub fn run(storage: StorageConfig, history: &Path, now_ms: Option<i64>) -> Result<(), AgentError> {
    let engine = Arc::new(open_engine(storage));
    let source = JsonExitHistory::new(history);
    let outcomes = engine
        .spawn_reconcile(Box::new(source), now_ms)?
        .join()
        .map_err(|_| AgentError::WorkerPanicked)??;

    let categories: Vec<Value> = outcomes
        .iter()
        .map(|(category, outcome)| summarize(*category, outcome))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "categories": categories }))?
    );
    Ok(())
}

fn summarize(category: ReportCategory, outcome: &ReconcileOutcome) -> Value {
    match outcome {
        ReconcileOutcome::AlreadyRan => json!({
            "category": category.label(),
            "outcome": "already_ran",
        }),
        ReconcileOutcome::NothingNew => json!({
            "category": category.label(),
            "outcome": "nothing_new",
        }),
        ReconcileOutcome::Processed {
            emitted,
            unreportable,
        } => {
            let reports: Vec<Value> = emitted
                .iter()
                .map(|report| {
                    json!({
                        "timestamp": report.timestamp,
                        "event_id": report.accepted().then(|| report.event_id.as_str().to_string()),
                        "enriched": report.enriched,
                        "flushed": report.flushed,
                    })
                })
                .collect();
            json!({
                "category": category.label(),
                "outcome": "processed",
                "reports": reports,
                "unreportable": unreportable,
            })
        }
    }
}
