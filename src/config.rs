use serde::Deserialize;
use std::path::{Path, PathBuf};
use crate::*;

pub const CONFIG_FILE_NAME: &str = "config.toml";

pub fn config_directory() -> Result<PathBuf> {
    let mut p = dirs::config_dir()
        .ok_or_else(|| anyhow!("unable to determine user config directory"))?;
    p.push("bcm-slurm-tools");
    Ok(p)
}

/// Site settings shared by all the tools.  Every key is optional.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where database backups are written when `-o` is not given.
    pub backup_dir: Option<PathBuf>,
    /// Explicit cmsh binary.
    pub cmsh: Option<PathBuf>,
    /// Explicit slurmdbd.conf, skips the search of the usual BCM locations.
    pub slurmdbd_conf: Option<PathBuf>,
    /// Seconds passed to `ssh -o ConnectTimeout`.
    pub ssh_connect_timeout: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backup_dir: None,
            cmsh: None,
            slurmdbd_conf: None,
            ssh_connect_timeout: 5,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid configuration")
    }

    /// Load `path` if given, otherwise the per-user config file if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = config_directory()?.join(CONFIG_FILE_NAME);
                if !p.exists() {
                    log::debug!("no config file at {:?}, using defaults", p);
                    return Ok(Config::default());
                }
                p
            }
        };
        log::debug!("reading config from {:?}", path);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {:?}", &path))?;
        Config::from_toml(&text).with_context(|| format!("in {:?}", &path))
    }
}
