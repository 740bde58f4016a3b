// Copyright 2021 Michael Rodler
// This file is part of ethfuzz.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Campaign configuration, loaded from YAML and overridden by environment variables.

use anyhow::Context;
use ethereum_types::H160;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(val) => {
            val.starts_with('y')
                || val.starts_with('Y')
                || val.starts_with('1')
                || val.starts_with('T')
                || val.starts_with('t')
        }
        Err(_) => false,
    }
}

lazy_static! {
    pub static ref NO_UI: bool = env_flag("EF_NO_UI");
    pub static ref FORCE_RANDOM_ORDER: bool = env_flag("EF_RANDOM_ORDER");
    pub static ref ADVISOR_TIMEOUT: Option<u64> = {
        match std::env::var("EF_ADVISOR_TIMEOUT") {
            Ok(val) => match val.parse() {
                Ok(i) => Some(i),
                Err(e) => panic!("invalid value for `EF_ADVISOR_TIMEOUT={}`: {}", val, e),
            },
            Err(_) => None,
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzConfig {
    /// campaign budget in seconds
    pub duration: u64,
    /// seconds spent on the trial run of each candidate order
    pub trial_duration: u64,
    /// seconds between two re-scorings of the current order
    pub evaluate_interval: u64,
    /// seconds between two status screens
    pub stat_interval: u64,
    /// number of candidate orders, 0 derives it from the number of functions
    pub num_orders: usize,
    /// fewer fuzz target functions are fatal
    pub min_functions: usize,
    pub advisor_retries: usize,
    /// seconds
    pub advisor_timeout: u64,
    /// never ask the advisor for orders
    pub random_order: bool,
    pub seed: u64,
    /// stop after this many executions
    pub max_execs: Option<u64>,
    pub report_dir: PathBuf,
    pub log_dir: PathBuf,
    /// hex encoded addresses for the address dictionary
    pub addresses: Vec<String>,
    pub show_ui: bool,
    /// contract source code shown to the advisor
    pub source: Option<PathBuf>,
}

impl Default for FuzzConfig {
    fn default() -> FuzzConfig {
        FuzzConfig {
            duration: 120,
            trial_duration: 5,
            evaluate_interval: 20,
            stat_interval: 1,
            num_orders: 15,
            min_functions: 6,
            advisor_retries: 5,
            advisor_timeout: 60,
            random_order: false,
            seed: 0,
            max_execs: None,
            report_dir: PathBuf::from("coverage"),
            log_dir: PathBuf::from("logs"),
            addresses: vec![],
            show_ui: true,
            source: None,
        }
    }
}

impl FuzzConfig {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<FuzzConfig> {
        let config: FuzzConfig = serde_yaml::from_str(yaml).context("malformed fuzzing configuration")?;
        anyhow::Result::Ok(config)
    }

    pub fn load_from_file(path: &std::path::Path) -> anyhow::Result<FuzzConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("failed to load config from file {}", path.display()))
    }

    /// Apply the `EF_*` environment overrides.
    pub fn with_env_overrides(mut self) -> FuzzConfig {
        if *NO_UI {
            self.show_ui = false;
        }
        if *FORCE_RANDOM_ORDER {
            self.random_order = true;
        }
        if let Some(t) = *ADVISOR_TIMEOUT {
            self.advisor_timeout = t;
        }
        self
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    #[inline]
    pub fn trial_duration(&self) -> Duration {
        Duration::from_secs(self.trial_duration)
    }

    #[inline]
    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.evaluate_interval)
    }

    #[inline]
    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval)
    }

    #[inline]
    pub fn advisor_timeout(&self) -> Duration {
        Duration::from_secs(self.advisor_timeout)
    }

    pub fn parsed_addresses(&self) -> anyhow::Result<Vec<H160>> {
        self.addresses
            .iter()
            .map(|a| {
                let bytes = hexutil::read_hex(hexutil::clean_0x(a.trim()))
                    .map_err(|e| anyhow::anyhow!("invalid address {:?}: {:?}", a, e))?;
                if bytes.len() != 20 {
                    anyhow::bail!("address {:?} has {} bytes instead of 20", a, bytes.len());
                }
                anyhow::Result::Ok(H160::from_slice(&bytes))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_defaults() {
        let c = FuzzConfig::from_yaml(
            "duration: 30\nnum_orders: 0\naddresses:\n  - \"0x00000000000000000000000000000000000000aa\"\n",
        )
        .unwrap();
        assert_eq!(c.duration, 30);
        assert_eq!(c.num_orders, 0);
        assert_eq!(c.trial_duration, 5);
        assert_eq!(c.min_functions, 6);
        assert_eq!(c.report_dir, PathBuf::from("coverage"));
        assert_eq!(
            c.parsed_addresses().unwrap(),
            vec![H160::from_low_u64_be(0xaa)]
        );
    }

    #[test]
    fn rejects_unknown_and_bad_values() {
        assert!(FuzzConfig::from_yaml("durration: 3\n").is_err());
        let c = FuzzConfig {
            addresses: vec!["0x1234".to_string()],
            ..Default::default()
        };
        assert!(c.parsed_addresses().is_err());
    }

    #[test]
    fn default_matches_empty_yaml() {
        assert_eq!(FuzzConfig::from_yaml("{}").unwrap(), FuzzConfig::default());
    }
}
