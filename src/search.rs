use anyhow::Result;

use fedsearch_core::intent::Conversation;
use fedsearch_core::rank::fused_score;

use crate::config::Config;
use crate::coordinator::StageStatus;
use crate::orchestrator::{Orchestrator, TurnResponse};

/// Run one turn for `request` and print the answer.
///
/// A planning failure is printed as a "cannot search" line rather than
/// returned as an error.
pub async fn run_search(config: &Config, request: &str, json: bool, limit: Option<usize>) -> Result<()> {
    let mut config = config.clone();
    if let Some(limit) = limit {
        config.orchestration.final_limit = limit.max(1);
    }
    let orchestrator = Orchestrator::from_config(&config)?;

    let response = match orchestrator.handle_turn(&Conversation::from_request(request)).await {
        Ok(r) => r,
        Err(e) => {
            println!("{}", e);
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    print_response(&orchestrator, &response);
    Ok(())
}

fn print_response(orchestrator: &Orchestrator, response: &TurnResponse) {
    let intent = &response.intent;
    println!(
        "intent: {} | sources: {} | temporal: {}",
        intent.goal,
        if intent.source_hints.is_empty() {
            "(any)".to_string()
        } else {
            intent.source_hints.join(", ")
        },
        intent.temporal.as_deref().unwrap_or("-")
    );
    if !intent.mode.is_search() {
        println!("mode: {}", intent.mode);
    }
    for stage in &response.stages {
        match &stage.status {
            StageStatus::Completed => {
                let entity = stage.resolved.as_ref().map(|e| format!(" (bound to {})", e.display()));
                println!(
                    "stage {} {}: {} step(s){}",
                    stage.index,
                    stage.goal,
                    stage.steps.len(),
                    entity.unwrap_or_default()
                );
            }
            StageStatus::Skipped { reason } => {
                println!("stage {} {}: skipped ({})", stage.index, stage.goal, reason);
            }
        }
    }
    for note in response.notes.iter().chain(intent.ambiguities.iter()) {
        println!("note: {}", note);
    }
    for error in &response.errors {
        println!("error: {} [{}] {}", error.source, error.kind, error.message);
    }
    println!();

    for tally in &response.tallies {
        match &tally.group_by {
            Some(field) => {
                println!("{}: {} matching, top by {}", tally.source, tally.total, field);
                for (i, group) in tally.groups.iter().enumerate() {
                    println!("  {}. {} ({})", i + 1, group.display(), group.count);
                }
            }
            None => println!("{}: {} matching", tally.source, tally.total),
        }
    }
    if !response.tallies.is_empty() {
        println!();
    }

    if response.results.is_empty() {
        if response.tallies.is_empty() {
            println!("No results.");
        }
        return;
    }

    for (i, item) in response.results.iter().enumerate() {
        let result = &item.result;
        let title = if result.title.is_empty() { "(untitled)" } else { &result.title };
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            fused_score(result, orchestrator.capabilities()),
            result.source,
            title
        );
        if let Some(ts) = result.timestamp {
            println!("    date: {}", ts.format("%Y-%m-%d %H:%M"));
        }
        if let Some(p) = &result.provenance {
            println!("    provenance: {}", p);
        }
        if !result.snippet.is_empty() {
            println!("    excerpt: \"{}\"", result.snippet.replace('\n', " ").trim());
        }
        if item.round > 0 {
            println!("    found in refinement round {}", item.round);
        }
        println!("    id: {}", result.id);
        println!();
    }
    println!("turn {} in {}ms", response.turn_id, response.timing_ms);
}
