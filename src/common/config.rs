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
use std::path::PathBuf;

use crate::siltstone_config::config as siltstone_app_config;

/// Worker threads for the parallel update/vacuum scans.
pub(crate) fn update_worker_threads() -> usize {
    let configured = siltstone_app_config()
        .ok()
        .map(|c| c.storage.update_worker_threads)
        .unwrap_or(0);
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default for the fragmenter's unconditional-vacuum test hook.
pub(crate) fn unconditional_vacuum_default() -> bool {
    siltstone_app_config()
        .ok()
        .map(|c| c.storage.unconditional_vacuum)
        .unwrap_or(false)
}

/// Base directory for checkpointed chunk images.
pub(crate) fn storage_data_dir() -> PathBuf {
    if let Some(dir) = siltstone_app_config()
        .ok()
        .and_then(|c| c.storage.data_dir.clone())
    {
        return dir;
    }
    let mut default_dir = std::env::temp_dir();
    default_dir.push("siltstone-data");
    default_dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_threads_fall_back_to_parallelism() {
        assert!(update_worker_threads() >= 1);
    }

    #[test]
    fn data_dir_has_a_default() {
        let dir = storage_data_dir();
        assert!(!dir.as_os_str().is_empty());
    }
}
