// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<SiltstoneConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static SiltstoneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = SiltstoneConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static SiltstoneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = SiltstoneConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static SiltstoneConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("SILTSTONE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("siltstone.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $SILTSTONE_CONFIG or create ./siltstone.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct SiltstoneConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "siltstone=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl SiltstoneConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: SiltstoneConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

impl Default for SiltstoneConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Base directory for checkpointed chunk images. Defaults to a
    /// directory under the system temp dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Worker threads for parallel update/vacuum scans. 0 means one per
    /// available CPU.
    #[serde(default)]
    pub update_worker_threads: usize,

    /// Force a synchronous vacuum on every delete-column update.
    #[serde(default)]
    pub unconditional_vacuum: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_storage_section() {
        let cfg: SiltstoneConfig = toml::from_str(
            r#"
            log_level = "debug"
            [storage]
            update_worker_threads = 2
            unconditional_vacuum = true
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.storage.update_worker_threads, 2);
        assert!(cfg.storage.unconditional_vacuum);
        assert!(cfg.storage.data_dir.is_none());
    }

    #[test]
    fn defaults_are_usable_without_file() {
        let cfg = SiltstoneConfig::default();
        assert_eq!(cfg.effective_log_filter(), "info");
        assert_eq!(cfg.storage.update_worker_threads, 0);
        assert!(!cfg.storage.unconditional_vacuum);
    }
}
