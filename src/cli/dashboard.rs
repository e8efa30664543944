use crate::backends::Agent;
use crate::engine::directory::AgentDirectory;
use crate::engine::{DashboardStats, Engine, EngineConfig};
use crate::ledger::{Ledger, LedgerEntry};
use chrono::{DateTime, Utc};

/// Agent load table straight from the CRM.
pub async fn agents(json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::from_config();
    let backend = crate::backends::from_config()?;
    let directory = AgentDirectory::new(backend, &config.open_status, config.require_online);
    let agents = directory.snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    print_agents(&agents);
    Ok(())
}

/// Latest ledger entries, newest first.
pub async fn recent(limit: usize, json: bool) -> anyhow::Result<()> {
    let ledger = open_ledger().await?;
    let entries = ledger.recent(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    print_recent(&entries, Utc::now());
    Ok(())
}

/// Headline stats, agents and recent assignments together.
pub async fn dashboard() -> anyhow::Result<()> {
    let engine = Engine::from_config().await?;
    let agents = engine.refresh_agents().await?;
    let stats = engine.stats().await?;
    let entries = engine.ledger().recent(10).await?;

    print_stats(&stats);
    println!();
    print_agents(&agents);
    println!();
    print_recent(&entries, Utc::now());
    Ok(())
}

async fn open_ledger() -> anyhow::Result<Ledger> {
    let ledger = Ledger::open(&crate::ledger::default_path()?)?;
    ledger.migrate().await?;
    Ok(ledger)
}

fn print_stats(stats: &DashboardStats) {
    for line in stats_lines(stats) {
        println!("{line}");
    }
}

fn stats_lines(stats: &DashboardStats) -> [String; 3] {
    [
        format!("  {:<16} {:>5}  currently clocked in", "Active agents", stats.active_agents),
        format!("  {:<16} {:>5}  deals assigned today", "Assigned today", stats.assigned_today),
        format!("  {:<16} {:>5}  awaiting assignment", "Pending deals", stats.pending),
    ]
}

fn print_agents(agents: &[Agent]) {
    println!("Agents ({} active)", agents.len());
    println!("  {:<8} {:<28} {:<7} {:>5}", "ID", "NAME", "ONLINE", "OPEN");
    for agent in agents {
        println!("{}", agent_row(agent));
    }
}

fn print_recent(entries: &[LedgerEntry], now: DateTime<Utc>) {
    println!("Recent assignments");
    if entries.is_empty() {
        println!("  (none)");
    }
    for entry in entries {
        println!("{}", entry_row(entry, now));
    }
}

fn agent_row(agent: &Agent) -> String {
    let open = agent
        .open_work_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  {:<8} {:<28} {:<7} {:>5}",
        agent.id,
        agent.display_name(),
        if agent.online { "yes" } else { "no" },
        open
    )
}

fn entry_row(entry: &LedgerEntry, now: DateTime<Utc>) -> String {
    format!(
        "  #{:<8} {:<30} → {:<24} {}",
        entry.record_id,
        entry.record_title,
        entry.agent_name,
        ago(&entry.assigned_at, now)
    )
}

fn ago(timestamp: &str, now: DateTime<Utc>) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => {
            let mins = (now - dt.with_timezone(&Utc)).num_minutes().max(0);
            if mins < 60 {
                format!("{mins}m ago")
            } else if mins < 60 * 24 {
                format!("{}h ago", mins / 60)
            } else {
                format!("{}d ago", mins / (60 * 24))
            }
        }
        Err(_) => timestamp.to_string(),
    }
}
