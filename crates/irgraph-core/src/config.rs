//! Engine settings: project and user `config.toml` files plus an environment override.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Environment variable overriding [`GraphConfig::cycle_check`].
pub const CYCLE_CHECK_ENV: &str = "IRGRAPH_CYCLE_CHECK";

/// When the engine runs the strongly-connected-component scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleCheckLevel {
    /// Never scan; a failed sort only logs that a cycle exists.
    Off,
    /// Scan and log the offending components when a topological sort fails.
    #[default]
    OnSortFailure,
    /// Additionally scan after every `add_node`. Expensive; debugging only.
    OnEveryEdit,
}

impl CycleCheckLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "off" | "none" | "0" => Some(Self::Off),
            "on_sort_failure" | "sort" | "1" => Some(Self::OnSortFailure),
            "on_every_edit" | "always" | "2" => Some(Self::OnEveryEdit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    #[serde(default)]
    pub cycle_check: CycleCheckLevel,
    /// Extra tracing of every relationship edit and topo dumps after sorts.
    #[serde(default)]
    pub debug_mode: bool,
    /// Initial value of the graph's breakpoint flag.
    #[serde(default)]
    pub breakpoint_mode: bool,
}

/// Load `<root>/.irgraph/config.toml`, falling back to defaults when absent.
pub fn load_project_config(project_root: &Path) -> Result<GraphConfig> {
    load_file(&project_root.join(".irgraph/config.toml"))
}

/// Load `<config dir>/irgraph/config.toml`, falling back to defaults.
pub fn load_user_config() -> Result<GraphConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(GraphConfig::default());
    };
    load_file(&config_dir.join("irgraph/config.toml"))
}

/// Project config if present, else user config, with the environment
/// override applied last.
pub fn resolve_config(project_root: &Path) -> Result<GraphConfig> {
    let project_file = project_root.join(".irgraph/config.toml");
    let base = if project_file.exists() {
        load_file(&project_file)?
    } else {
        load_user_config()?
    };
    Ok(apply_env_override(base, env::var(CYCLE_CHECK_ENV).ok().as_deref()))
}

/// Apply an `IRGRAPH_CYCLE_CHECK` value. Unknown values are ignored with a
/// warning.
#[must_use]
pub fn apply_env_override(mut config: GraphConfig, raw: Option<&str>) -> GraphConfig {
    if let Some(raw) = raw {
        match CycleCheckLevel::parse(raw) {
            Some(level) => config.cycle_check = level,
            None => tracing::warn!(value = raw, "ignoring unrecognised {CYCLE_CHECK_ENV}"),
        }
    }
    config
}

fn load_file(path: &Path) -> Result<GraphConfig> {
    if !path.exists() {
        return Ok(GraphConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<GraphConfig>(&content).with_context(|| {
        format!(
            "{}: Failed to parse {}",
            crate::error::ErrorCode::ConfigParseError,
            path.display()
        )
    })
}
