//! Script name to filesystem path resolution
//!
//! Names beginning with `_` or `.` are never invocable over HTTP. A script
//! file may itself start with `.` (hidden but enabled) or `_` (disabled).

use crate::config::ScriptsConfig;
use crate::error::BridgeError;
use std::path::{Path, PathBuf};

/// A script that can be launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Name as requested in the URL
    pub name: String,
    /// Path to the script file
    pub path: PathBuf,
    /// Whether the script can be invoked
    pub enabled: bool,
}

/// Looks scripts up in a single directory
#[derive(Debug, Clone)]
pub struct ScriptResolver {
    dir: PathBuf,
    extension: String,
}

impl ScriptResolver {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &ScriptsConfig) -> Self {
        Self::new(config.dir.clone(), config.extension.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a requested name to an enabled script.
    ///
    /// Probes `<name>.<ext>` then `.<name>.<ext>`. When neither exists, a
    /// `_<name>.<ext>` file turns the failure into `Disabled`.
    pub fn resolve(&self, name: &str) -> Result<Script, BridgeError> {
        if name.starts_with('_') || name.starts_with('.') {
            return Err(BridgeError::Disabled {
                script: name.to_string(),
            });
        }

        if !is_plain_name(name) {
            return Err(BridgeError::NotFound {
                script: name.to_string(),
            });
        }

        for candidate in [self.file_name(name, ""), self.file_name(name, ".")] {
            let path = self.dir.join(candidate);
            if path.is_file() {
                return Ok(Script {
                    name: name.to_string(),
                    path,
                    enabled: true,
                });
            }
        }

        if self.dir.join(self.file_name(name, "_")).is_file() {
            return Err(BridgeError::Disabled {
                script: name.to_string(),
            });
        }

        Err(BridgeError::NotFound {
            script: name.to_string(),
        })
    }

    /// Every script file in the directory, sorted by name.
    pub fn list(&self) -> std::io::Result<Vec<Script>> {
        let suffix = format!(".{}", self.extension);
        let mut scripts = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(&suffix) else {
                continue;
            };

            let (name, enabled) = if let Some(rest) = stem.strip_prefix('_') {
                (rest, false)
            } else if let Some(rest) = stem.strip_prefix('.') {
                (rest, true)
            } else {
                (stem, true)
            };

            if name.is_empty() {
                continue;
            }

            scripts.push(Script {
                name: name.to_string(),
                path: path.clone(),
                enabled,
            });
        }

        scripts.sort_by(|a, b| a.name.cmp(&b.name).then(a.path.cmp(&b.path)));
        Ok(scripts)
    }

    fn file_name(&self, name: &str, prefix: &str) -> String {
        format!("{}{}.{}", prefix, name, self.extension)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\', '\0'])
}
