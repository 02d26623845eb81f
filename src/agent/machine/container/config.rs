use std::path::Path;

use anyhow::{Context, Result};

/// An lxc container configuration file, as ordered `key = value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    entries: Vec<(String, String)>,
}

impl ContainerConfig {
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();

        Self { entries }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render())
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key} = {value}\n"))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a single-valued key, replacing any previous values.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = k != key || index == first;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Adds a value to a multi-valued key unless it is already present.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if !self.entries.iter().any(|(k, v)| k == key && *v == value) {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn remove_prefix(&mut self, prefix: &str) {
        self.entries.retain(|(k, _)| !k.starts_with(prefix));
    }
}
