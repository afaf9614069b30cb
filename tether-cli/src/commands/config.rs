use std::path::Path;

use anyhow::Result;
use tether_core::config::{self, EngineConfig};

use crate::commands::ConfigAction;

pub fn run_config_command(action: ConfigAction, config: EngineConfig, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
        }
        ConfigAction::Init => {
            let path = match path {
                Some(p) => p.to_path_buf(),
                None => EngineConfig::default_path()?,
            };
            if path.exists() {
                eprintln!("Config already exists at: {}", path.display());
                eprintln!("Edit it directly or delete it first.");
            } else {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, config::sample_config())?;
                eprintln!("✅ Config written to: {}", path.display());
                eprintln!("   Point [provider] endpoint at your model server.");
            }
        }
    }
    Ok(())
}
