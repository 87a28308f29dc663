use anyhow::{Context, Result};
use config_rs::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Date-time column types understood by the compiler
pub const DATE_TIME_TYPES: &[&str] = &["DATETIME", "DATETIME64", "TIMESTAMP"];

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(Default)]
pub struct Config {
    /// Defaults applied to every query target
    #[serde(default)]
    pub target: TargetConfig,

    /// Compiler limits and defaults
    #[serde(default)]
    pub compiler: CompilerConfig,
}

/// Table and time columns a query reads when it doesn't say otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database substituted for `$table` and bare table names
    #[serde(default = "default_database")]
    pub database: String,

    /// Table substituted for `$table`
    #[serde(default)]
    pub table: String,

    /// `Date` column used for partition pruning (optional)
    #[serde(default)]
    pub date_col: String,

    /// Time column used by `$timeSeries` and `$timeFilter`
    #[serde(default = "default_date_time_col")]
    pub date_time_col: String,

    /// One of DATETIME, DATETIME64, TIMESTAMP
    #[serde(default = "default_date_time_type")]
    pub date_time_type: String,

    /// Bucket width (e.g., "30s", "1m"); empty uses the panel interval
    #[serde(default)]
    pub interval: String,

    /// Multiplier applied to the interval (default: 1)
    #[serde(default = "default_interval_factor")]
    pub interval_factor: u32,

    /// Time range rounding: empty, "$step" or a duration
    #[serde(default)]
    pub round: String,
}

/// Configuration for the query compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Maximum sub-query nesting accepted by the parser (default: 64)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Panel interval used when a target has none (default: "30s")
    #[serde(default = "default_panel_interval")]
    pub panel_interval: String,

    /// Database used to shorten ad-hoc filter keys to `table.column`
    #[serde(default)]
    pub adhoc_default_database: String,
}

// Default value functions
fn default_database() -> String {
    "default".to_string()
}

fn default_date_time_col() -> String {
    "EventTime".to_string()
}

fn default_date_time_type() -> String {
    "DATETIME".to_string()
}

fn default_interval_factor() -> u32 {
    1
}

fn default_max_depth() -> usize {
    64
}

fn default_panel_interval() -> String {
    "30s".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            table: String::new(),
            date_col: String::new(),
            date_time_col: default_date_time_col(),
            date_time_type: default_date_time_type(),
            interval: String::new(),
            interval_factor: default_interval_factor(),
            round: String::new(),
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            panel_interval: default_panel_interval(),
            adhoc_default_database: String::new(),
        }
    }
}

impl Config {
    /// Load Config with layered configuration priority:
    /// 1. Default values
    /// 2. TOML file (if provided)
    /// 3. Environment variables (`CHQUERY_` prefix, `__` between levels,
    ///    e.g. `CHQUERY_TARGET__TABLE`)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            // Target defaults
            .set_default("target.database", default_database())?
            .set_default("target.date_time_col", default_date_time_col())?
            .set_default("target.date_time_type", default_date_time_type())?
            .set_default("target.interval_factor", default_interval_factor() as i64)?
            // Compiler defaults
            .set_default("compiler.max_depth", default_max_depth() as i64)?
            .set_default("compiler.panel_interval", default_panel_interval())?;

        // Add TOML file if provided
        if let Some(file_path) = config_file {
            let path = Path::new(file_path);
            if !path.exists() {
                anyhow::bail!("Configuration file not found: {}", path.display());
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CHQUERY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load Config from a TOML file
    ///
    /// Environment variables can still override values from the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .with_context(|| format!("Configuration path is not valid UTF-8: {}", path.display()))?;
        Self::load(Some(path))
    }

    /// Create a new Config from environment variables with defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        self.compiler.validate()?;
        Ok(())
    }
}

impl TargetConfig {
    /// Validate the target defaults
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.date_time_col.is_empty(),
            "Target date_time_col cannot be empty"
        );
        anyhow::ensure!(
            DATE_TIME_TYPES.contains(&self.date_time_type.to_ascii_uppercase().as_str()),
            "Target date_time_type must be one of {}, got {}",
            DATE_TIME_TYPES.join(", "),
            self.date_time_type
        );
        anyhow::ensure!(
            self.interval_factor > 0,
            "Target interval_factor must be greater than 0"
        );
        Ok(())
    }
}

impl CompilerConfig {
    /// Validate the compiler configuration
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_depth > 0, "Compiler max_depth must be greater than 0");
        anyhow::ensure!(
            !self.panel_interval.is_empty(),
            "Compiler panel_interval cannot be empty"
        );
        Ok(())
    }
}
