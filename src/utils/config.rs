//! Minimal INI-style configuration, used by the daemon binary.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

const MAX_SECTIONS: usize = 100;
const MAX_ENTRIES_PER_SECTION: usize = 100;

pub type ConfigSection = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: HashMap<String, ConfigSection>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section.is_empty() || key.is_empty() {
            return Err(anyhow::anyhow!("section or key cannot be empty"));
        }

        if self.sections.len() >= MAX_SECTIONS && !self.sections.contains_key(section) {
            return Err(anyhow::anyhow!("maximum number of sections ({}) reached", MAX_SECTIONS));
        }

        let section_map = self.sections.entry(section.to_string()).or_default();
        if section_map.len() >= MAX_ENTRIES_PER_SECTION {
            return Err(
                anyhow::anyhow!(
                    "maximum entries per section ({}) reached for section '{}'",
                    MAX_ENTRIES_PER_SECTION,
                    section
                )
            );
        }

        debug!("setting config: [{}] {} = {}", section, key, value);
        section_map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|section_map| section_map.get(key))
            .map(|v| v.as_str())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.get_value(section, key) {
            Some(val) =>
                match val.parse::<i64>() {
                    Ok(num) => num,
                    Err(_) => {
                        warn!(
                            "invalid integer value '{}' for {}.{}, using default {}",
                            val,
                            section,
                            key,
                            default
                        );
                        default
                    }
                }
            None => default,
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_value(section, key) {
            Some(val) => {
                match val.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" | "enabled" => true,
                    "0" | "false" | "no" | "off" | "disabled" => false,
                    _ => {
                        warn!(
                            "invalid boolean value '{}' for {}.{}, using default {}",
                            val,
                            section,
                            key,
                            default
                        );
                        default
                    }
                }
            }
            None => default,
        }
    }

    pub fn is_section_exists(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }
}

pub struct ConfigLoader {
    path: String,
}

impl ConfigLoader {
    pub fn new(path: String) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Config> {
        let filepath = self.path.trim();

        let config_path = Path::new(filepath);
        if !config_path.is_file() {
            return Err(anyhow::anyhow!("config file does not exist: {}", filepath));
        }

        let contents = fs::read_to_string(config_path)?;
        Ok(Self::parse(&contents))
    }

    fn parse(contents: &str) -> Config {
        let mut config = Config::new();
        let mut current_section = String::new();

        for (index, line) in contents.lines().enumerate() {
            let line_number = index + 1;
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // Section header: [section]
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                if current_section.is_empty() {
                    warn!("empty section name at line {}", line_number);
                }
                continue;
            }

            // Key-value pair
            if let Some(equals_pos) = trimmed.find('=') {
                let key = trimmed[..equals_pos].trim();
                let value = Self::unquote(trimmed[equals_pos + 1..].trim());

                if key.is_empty() {
                    warn!("empty key at line {}", line_number);
                    continue;
                }
                if current_section.is_empty() {
                    warn!("key-value pair '{}' outside of section at line {}", key, line_number);
                    continue;
                }

                if let Err(e) = config.set_value(&current_section, key, value) {
                    warn!("failed to set config value at line {}: {}", line_number, e);
                }
            } else {
                warn!("invalid config line (no '=' found) at line {}: {}", line_number, trimmed);
            }
        }

        config
    }

    fn unquote(value: &str) -> &str {
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            let (first, last) = (bytes[0], bytes[value.len() - 1]);
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                return &value[1..value.len() - 1];
            }
        }
        value
    }
}
