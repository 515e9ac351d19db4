use crate::error::{PanelError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub paneld: PaneldConfig,

    #[serde(default)]
    pub grid: GridConfig,
}

/// Global daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PaneldConfig {
    /// Path of the JSON control database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

/// The control grid seeded on first run.
#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// Number of pages, 1-99.
    #[serde(default = "default_pages")]
    pub pages: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,

    #[serde(default = "default_columns")]
    pub columns: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/paneld/db.json")
}

fn default_pages() -> u32 {
    1
}

fn default_rows() -> u32 {
    3
}

fn default_columns() -> u32 {
    5
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            pages: default_pages(),
            rows: default_rows(),
            columns: default_columns(),
        }
    }
}

impl GridConfig {
    pub fn buttons_per_page(&self) -> u32 {
        self.rows * self.columns
    }
}

/// Load and parse configuration from a TOML file.
///
/// # Errors
/// Returns `PanelError::ConfigNotFound` if the file doesn't exist,
/// `PanelError::Io` on read errors, `PanelError::TomlParse` on syntax errors,
/// or `PanelError::Config` on validation failures.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Err(PanelError::ConfigNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let content = expand_env_vars(&content);
    let config: AppConfig = toml::from_str(&content)?;

    validate(&config)?;
    Ok(config)
}

/// Expand `${VAR}` and `$VAR` patterns in the config string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    // Keep original if env var not found
                    use std::fmt::Write;
                    let _ = write!(result, "${{{var_name}}}");
                }
            } else {
                let var_name: String = chars
                    .by_ref()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if var_name.is_empty() {
                    result.push('$');
                } else if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                } else {
                    result.push('$');
                    result.push_str(&var_name);
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Validate config constraints.
fn validate(config: &AppConfig) -> Result<()> {
    if config.grid.pages == 0 || config.grid.pages > 99 {
        return Err(PanelError::Config("grid.pages must be 1-99".to_string()));
    }
    if config.grid.rows == 0 || config.grid.rows > 8 {
        return Err(PanelError::Config("grid.rows must be 1-8".to_string()));
    }
    if config.grid.columns == 0 || config.grid.columns > 8 {
        return Err(PanelError::Config("grid.columns must be 1-8".to_string()));
    }
    Ok(())
}
