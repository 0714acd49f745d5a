// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data structures and helper methods around influencing the configuration
//! of the application.

use anyhow::{Context, Result};
use ini::Ini;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = "caretsync";
pub const CONFIG_FILE: &str = "config";

/// The port both peers must agree on.
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Values read from the config file. CLI options take precedence over all of
/// these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub role: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl FileConfig {
    pub fn load(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            return Ok(Self::default());
        }
        let conf = Ini::load_from_file(config_file)
            .with_context(|| format!("Could not parse config file {}", config_file.display()))?;
        let general_section = conf.general_section();
        Ok(Self {
            role: general_section.get("role").map(ToString::to_string),
            host: general_section.get("host").map(ToString::to_string),
            port: general_section
                .get("port")
                .map(|port| {
                    port.parse()
                        .context("Failed to parse config parameter `port` as an integer")
                })
                .transpose()?,
        })
    }
}

/// `$XDG_CONFIG_HOME/caretsync/config`, or the `~/.config` fallback.
#[must_use]
pub fn default_config_file() -> Option<PathBuf> {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME").map_or_else(
        || {
            let home = std::env::var_os("HOME")?;
            Some(Path::new(&home).join(".config"))
        },
        |dir| Some(PathBuf::from(dir)),
    )?;
    Some(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
}
