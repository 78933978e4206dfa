use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

pub trait Config: DeserializeOwned + Default {
    fn try_from_section(section: Option<&Value>) -> Result<Self, de::Error> {
        match section {
            Some(value) => value.clone().try_into(),
            None => {
                warn!("config section not found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn from_section(section: Option<&Value>) -> Self {
        Self::try_from_section(section).expect("cannot deserialize config")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub kernel: Option<PathBuf>,
    pub log_level: u64,
    /// Host-imposed cycle budget.
    pub max_cycles: u64,
    /// Counter class programmed into MPM_CLASS before launch.
    pub perf_class: u32,
    pub record_events: bool,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            kernel: None,
            log_level: 0,
            max_cycles: 10_000_000,
            perf_class: 0,
            record_events: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemConfig {
    /// Size of the simulated address space in bytes.
    pub size: u64,
    /// Cycles from request acceptance to response.
    pub latency: u64,
    /// Requests the controller keeps in flight at once.
    pub depth: usize,
    /// Channel bandwidth; a line of `line_size` bytes occupies it for ceil(size/bpc) cycles.
    pub bytes_per_cycle: u32,
    pub port_capacity: usize,
}

impl Config for MemConfig {}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            size: 1 << 32,
            latency: 100,
            depth: 16,
            bytes_per_cycle: 64,
            port_capacity: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_falls_back_to_defaults() {
        let config = SimConfig::from_section(None);
        assert_eq!(config.max_cycles, 10_000_000);
        assert!(!config.record_events);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let table: Table = toml::from_str("[mem]\nlatency = 7\n").unwrap();
        let config = MemConfig::from_section(table.get("mem"));
        assert_eq!(config.latency, 7);
        assert_eq!(config.depth, 16);
    }

    #[test]
    fn malformed_section_is_an_error() {
        let table: Table = toml::from_str("[mem]\nlatency = \"fast\"\n").unwrap();
        assert!(MemConfig::try_from_section(table.get("mem")).is_err());
    }
}
