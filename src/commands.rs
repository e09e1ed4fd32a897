use crate::config::Config;
use crate::error::{ConfigError, LazycommError, Result};
use crate::script::ScriptResolver;
use tracing::{error, info, warn};

/// Validate `config` and report every script the server could run.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    // Validate configuration
    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");
    info!("  Listen address: {}", config.listen_addr());
    info!(
        "  Interpreter: {} {}",
        config.scripts.interpreter,
        config.scripts.interpreter_args.join(" ")
    );
    info!("  Log directory: {}", config.logging.dir.display());

    let resolver = ScriptResolver::from_config(&config.scripts);
    info!("\nChecking scripts in: {}", resolver.dir().display());

    let scripts = match resolver.list() {
        Ok(scripts) => scripts,
        Err(e) => {
            error!("  ✗ Cannot read scripts directory: {}", e);
            return Err(LazycommError::Config(ConfigError::Validation(format!(
                "Scripts directory {} is not readable: {}",
                resolver.dir().display(),
                e
            ))));
        }
    };

    if scripts.is_empty() {
        warn!("  ! No *.{} scripts found", config.scripts.extension);
    }

    for script in &scripts {
        if script.enabled {
            info!("  ✓ /{} -> {}", script.name, script.path.display());
        } else {
            info!("  - {} (disabled) -> {}", script.name, script.path.display());
        }
    }

    let enabled = scripts.iter().filter(|s| s.enabled).count();
    info!("\n✓ All checks passed ({} of {} scripts enabled)", enabled, scripts.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_check_passes_with_scripts_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("greet.py"), "").unwrap();
        std::fs::write(dir.path().join("_draft.py"), "").unwrap();

        let mut config = Config::default();
        config.scripts.dir = dir.path().to_path_buf();

        assert!(run_config_check(config).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_fails_without_scripts_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.scripts.dir = dir.path().join("missing");

        assert!(matches!(
            run_config_check(config).await,
            Err(LazycommError::Config(ConfigError::Validation(_)))
        ));
    }
}
