//! Home directory utilities.
//!
//! Everything leadroute keeps on disk (global config, the assignment ledger)
//! lives under `~/.leadroute/`. `LEADROUTE_HOME` overrides the location, which
//! is how service deployments point it at a data volume.

use std::path::PathBuf;

/// Directory name under the user's home.
const APP_DIR: &str = ".leadroute";

/// Environment override for the home directory.
const HOME_ENV: &str = "LEADROUTE_HOME";

/// Get the leadroute home directory, creating it if needed.
pub fn app_home() -> anyhow::Result<PathBuf> {
    let path = match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?
            .join(APP_DIR),
    };
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Default ledger database path (`~/.leadroute/ledger.db`).
pub fn ledger_path() -> anyhow::Result<PathBuf> {
    Ok(app_home()?.join("ledger.db"))
}
