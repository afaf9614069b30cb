use anyhow::{Context, Result};
use tether_core::config::EngineConfig;
use tether_core::session::SessionStore;
use tether_storage_fs::FsSessionStore;

pub async fn run_sessions_command(config: EngineConfig) -> Result<()> {
    let data_dir = config.data_dir()?;
    let store = FsSessionStore::new(&data_dir).context("failed to open session store")?;
    let sessions = store.list().await?;

    if sessions.is_empty() {
        eprintln!("No sessions in {}", store.sessions_dir().display());
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  {:>10}  {}",
            session.modified.format("%Y-%m-%d %H:%M:%S"),
            format_size(session.size_bytes),
            session.id
        );
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    match bytes {
        b if b >= 1024 * 1024 => format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)),
        b if b >= 1024 => format!("{:.1} KiB", b as f64 / 1024.0),
        b => format!("{b} B"),
    }
}
