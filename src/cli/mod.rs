pub mod dashboard;

use crate::engine::Engine;

/// Print version information.
pub fn version() {
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_desc = option_env!("LEADROUTE_GIT_DESCRIBE").unwrap_or("unknown");
    println!("leadroute {pkg_version} ({git_desc})");
}

/// Run one assignment cycle and print the tally.
pub async fn assign_once(json: bool) -> anyhow::Result<()> {
    let engine = Engine::from_config().await?;
    let report = engine.run_assignment_cycle().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "fetched {}  assigned {}  skipped {}  failed {}",
            report.fetched, report.assigned, report.skipped, report.failed
        );
    }
    Ok(())
}

/// Print a config value, or the effective default for known keys.
pub fn config(key: &str) -> anyhow::Result<()> {
    match crate::config::get(key) {
        Ok(val) => println!("{val}"),
        Err(e) => match default_for(key) {
            Some(default) => println!("{default}"),
            None => return Err(e),
        },
    }
    Ok(())
}

fn default_for(key: &str) -> Option<&'static str> {
    Some(match key {
        "crm.entity" => "deal",
        "crm.open_status" => "NEW",
        "crm.max_retries" => "3",
        "crm.backoff_ms" => "1000",
        "crm.timeout_seconds" => "30",
        "agents.require_online" => "true",
        "engine.stats_interval_seconds" => "60",
        "engine.assignment_interval_seconds" => "120",
        "engine.window_seconds" => "300",
        "server.bind" => "0.0.0.0:3000",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_have_defaults() {
        assert_eq!(default_for("crm.max_retries"), Some("3"));
        assert_eq!(default_for("server.bind"), Some("0.0.0.0:3000"));
        assert_eq!(default_for("crm.webhook_url"), None);
        assert_eq!(default_for("nope"), None);
    }
}
