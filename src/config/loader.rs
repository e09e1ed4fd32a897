use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "LAZYCOMM_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("config.toml"))
        .merge(Toml::file("lazycomm.toml"))
        .merge(Json::file("lazycomm.json"))
        .merge(Yaml::file("lazycomm.yaml"))
        .merge(Yaml::file("lazycomm.yml"))
        // Override with environment variables (LAZYCOMM_ prefix, `__` for nesting)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Configuration file not found: {}",
            path.display()
        ))
        .into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        return Err(ConfigError::Validation("Server port must be greater than 0".into()).into());
    }

    if config.scripts.interpreter.trim().is_empty() {
        return Err(ConfigError::Validation("Script interpreter cannot be empty".into()).into());
    }

    let extension = &config.scripts.extension;
    if extension.is_empty() {
        return Err(ConfigError::Validation("Script extension cannot be empty".into()).into());
    }
    if extension.contains('.') || extension.contains('/') {
        return Err(ConfigError::Validation(format!(
            "Script extension '{}' must be given without dots or slashes",
            extension
        ))
        .into());
    }

    if config.bridge.diagnostic_limit_bytes == 0 {
        return Err(ConfigError::Validation(
            "Diagnostic limit must be greater than 0".into(),
        )
        .into());
    }

    if config.bridge.timeout_ms == Some(0) {
        return Err(ConfigError::Validation(
            "Script timeout must be greater than 0 (use null to disable it)".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.scripts.dir = substitute_path(&config.scripts.dir)?;
    config.logging.dir = substitute_path(&config.logging.dir)?;
    config.scripts.interpreter = substitute_env_vars(&config.scripts.interpreter)?;

    for arg in &mut config.scripts.interpreter_args {
        *arg = substitute_env_vars(arg)?;
    }

    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => Ok(PathBuf::from(substitute_env_vars(text)?)),
        None => Ok(path.to_path_buf()),
    }
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {}", e)))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];

        // `${VAR:-default}` falls back when VAR is unset
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }

        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StdoutPolicy;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("LAZYCOMM_TEST_VAR", "test_value");

        let result = substitute_env_vars("Hello ${LAZYCOMM_TEST_VAR}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${LAZYCOMM_MISSING_VAR:-default}").unwrap();
        assert_eq!(result, "default");

        assert!(substitute_env_vars("${LAZYCOMM_MISSING_VAR}").is_err());

        std::env::remove_var("LAZYCOMM_TEST_VAR");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(validate(&config).is_ok());

        config.scripts.extension = ".py".to_string();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.bridge.diagnostic_limit_bytes = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.bridge.timeout_ms = Some(0);
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.bridge.timeout_ms = None;
        assert!(validate(&config).is_ok());
    }

    #[tokio::test]
    async fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 7000

[scripts]
dir = "./handlers"
interpreterArgs = []

[bridge]
stdoutPolicy = "log"
timeoutMs = 1500
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.scripts.dir, PathBuf::from("./handlers"));
        assert!(config.scripts.interpreter_args.is_empty());
        assert_eq!(config.scripts.interpreter, "python");
        assert_eq!(config.bridge.stdout_policy, StdoutPolicy::Log);
        assert_eq!(config.bridge.timeout_ms, Some(1500));
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_format() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).await.is_err());
    }
}
