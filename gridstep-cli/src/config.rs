//! Coordinator configuration: TOML file with every field defaulted,
//! overridable from the command line.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ArgMatches;

use gridstep_core::SystemMode;
use gridstep_net::server::{
    DEFAULT_BIND, DEFAULT_CLIENT_PORT, DEFAULT_CONTROL_PORT, DEFAULT_HISTORY_PATH,
    DEFAULT_SOLVER_PORT, DEFAULT_STEP_SECONDS,
};
use gridstep_net::HubSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the three listeners bind to.
    pub bind: String,
    pub client_port: u16,
    pub control_port: u16,
    pub solver_port: u16,
    /// Wall-clock seconds represented by one simulation step.
    pub step_seconds: u32,
    /// Grid operating mode: 0 normal, 1 regulation.
    pub mode: SystemMode,
    /// Where the client connection history is appended.
    pub history_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: DEFAULT_BIND.to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            solver_port: DEFAULT_SOLVER_PORT,
            step_seconds: DEFAULT_STEP_SECONDS,
            mode: SystemMode::default(),
            history_path: PathBuf::from(DEFAULT_HISTORY_PATH),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed reading config at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed parsing config at {}", path.display()))
    }

    /// Applies command line overrides on top of the file values.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(bind) = matches.value_of("bind") {
            self.bind = bind.to_string();
        }
        if let Some(port) = matches.value_of("client-port") {
            self.client_port = port.parse().context("bad --client-port")?;
        }
        if let Some(port) = matches.value_of("control-port") {
            self.control_port = port.parse().context("bad --control-port")?;
        }
        if let Some(port) = matches.value_of("solver-port") {
            self.solver_port = port.parse().context("bad --solver-port")?;
        }
        if let Some(step) = matches.value_of("step") {
            self.step_seconds = step.parse().context("bad --step")?;
        }
        if let Some(mode) = matches.value_of("mode") {
            self.mode = match mode {
                "0" | "normal" => SystemMode::Normal,
                "1" | "regulation" => SystemMode::Regulation,
                other => anyhow::bail!("bad --mode {:?}: expected normal or regulation", other),
            };
        }
        if let Some(path) = matches.value_of("history") {
            self.history_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn into_settings(self) -> HubSettings {
        HubSettings {
            bind: self.bind,
            client_port: self.client_port,
            control_port: self.control_port,
            solver_port: self.solver_port,
            step_seconds: self.step_seconds,
            mode: self.mode,
            history_path: self.history_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_the_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let defaults = Config::default();
        assert_eq!(config.client_port, defaults.client_port);
        assert_eq!(config.control_port, defaults.control_port);
        assert_eq!(config.solver_port, defaults.solver_port);
        assert_eq!(config.bind, defaults.bind);
        assert_eq!(config.mode, SystemMode::Normal);
    }

    #[test]
    fn file_values_override_the_defaults() {
        let config: Config = toml::from_str(
            r#"
            bind = "127.0.0.1"
            client_port = 7001
            step_seconds = 900
            mode = 1
            history_path = "audit.txt"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.client_port, 7001);
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.step_seconds, 900);
        assert_eq!(config.mode, SystemMode::Regulation);
        assert_eq!(config.history_path, PathBuf::from("audit.txt"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[test]
    fn from_path_reads_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "solver_port = 7002").unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.solver_port, 7002);
    }
}
