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
//! Per-statement transaction roll.
//!
//! Every mutation of an UPDATE/DELETE statement stages through one
//! `UpdelRoll`: dirty chunks stay pinned here, fragment metadata is
//! shadowed here, and `commit_update`/`cancel_update` are the only two
//! ways a statement ends. Commit publishes the shadow state under the
//! fragmenter's write lock and evicts stale GPU copies; cancel releases
//! dirty buffers that have no authoritative backing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::common::ids::ChunkKey;
use crate::datamgr::MemoryLevel;
use crate::datamgr::chunk::Chunk;
use crate::fragmenter::ChunkMetadataMap;

/// Addresses one fragment's shadow state: `(table_id, fragment_id)`.
pub type MetaDataKey = (i32, i32);

pub(crate) struct RollState {
    pub(crate) catalog: Option<Arc<Catalog>>,
    pub(crate) logical_table_id: i32,
    pub(crate) memory_level: MemoryLevel,
    pub(crate) dirty_chunks: HashMap<ChunkKey, Chunk>,
    pub(crate) dirty_chunkeys: BTreeSet<ChunkKey>,
    pub(crate) chunk_metadata: HashMap<MetaDataKey, ChunkMetadataMap>,
    pub(crate) num_tuples: HashMap<MetaDataKey, usize>,
}

impl Default for RollState {
    fn default() -> Self {
        Self {
            catalog: None,
            logical_table_id: -1,
            memory_level: MemoryLevel::Cpu,
            dirty_chunks: HashMap::new(),
            dirty_chunkeys: BTreeSet::new(),
            chunk_metadata: HashMap::new(),
            num_tuples: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct UpdelRoll {
    state: Mutex<RollState>,
}

impl UpdelRoll {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RollState) -> R) -> R {
        let mut state = self.state.lock().expect("updel roll lock");
        f(&mut state)
    }

    pub(crate) fn record_statement(
        &self,
        catalog: &Arc<Catalog>,
        logical_table_id: i32,
        memory_level: MemoryLevel,
    ) {
        self.with_state(|state| {
            if state.catalog.is_none() {
                state.catalog = Some(Arc::clone(catalog));
            }
            state.logical_table_id = logical_table_id;
            state.memory_level = memory_level;
        });
    }

    /// Pin a mutated chunk for the lifetime of the statement and mark its
    /// key for GPU-eviction fan-out.
    pub(crate) fn add_dirty_chunk(&self, chunk: Chunk, chunkey: ChunkKey) {
        self.with_state(|state| {
            state.dirty_chunks.entry(chunk.key()).or_insert(chunk);
            state.dirty_chunkeys.insert(chunkey);
        });
    }

    /// Shadow metadata and tuple count staged for `key`, if any.
    pub(crate) fn shadow_for(&self, key: MetaDataKey) -> Option<(ChunkMetadataMap, Option<usize>)> {
        self.with_state(|state| {
            state
                .chunk_metadata
                .get(&key)
                .cloned()
                .map(|map| (map, state.num_tuples.get(&key).copied()))
        })
    }

    pub fn logical_table_id(&self) -> i32 {
        self.with_state(|state| state.logical_table_id)
    }

    pub fn memory_level(&self) -> MemoryLevel {
        self.with_state(|state| state.memory_level)
    }

    pub fn dirty_chunk_count(&self) -> usize {
        self.with_state(|state| state.dirty_chunks.len())
    }

    pub fn has_dirty_chunk(&self, key: ChunkKey) -> bool {
        self.with_state(|state| state.dirty_chunks.contains_key(&key))
    }

    /// Whether every pinned dirty chunk has released its buffers. Only
    /// meaningful after `cancel_update`.
    pub fn dirty_buffers_released(&self) -> bool {
        self.with_state(|state| state.dirty_chunks.values().all(|c| !c.has_buffers()))
    }

    pub fn num_tuples_for(&self, key: MetaDataKey) -> Option<usize> {
        self.with_state(|state| state.num_tuples.get(&key).copied())
    }

    /// Two-phase commit: checkpoint disk-backed tables first (all shards,
    /// keeping epochs aligned), then publish every fragment's shadow
    /// metadata under the fragmenter's write lock, release the chunk
    /// pins, and finally evict stale GPU copies.
    pub fn commit_update(&self) -> Result<(), String> {
        let (catalog, logical_table_id, memory_level, mut keys, chunkeys) =
            self.with_state(|state| {
                (
                    state.catalog.clone(),
                    state.logical_table_id,
                    state.memory_level,
                    state.chunk_metadata.keys().copied().collect::<Vec<_>>(),
                    state.dirty_chunkeys.iter().copied().collect::<Vec<_>>(),
                )
            });
        let Some(catalog) = catalog else {
            return Ok(());
        };
        let td = catalog.get_metadata_for_table_by_id(logical_table_id)?;
        if td.persistence_level == MemoryLevel::Disk {
            catalog.checkpoint(logical_table_id)?;
        }
        keys.sort_unstable();
        for key in &keys {
            let key_td = catalog.get_metadata_for_table_by_id(key.0)?;
            key_td.fragmenter.update_metadata(&catalog, *key, self)?;
        }
        self.with_state(|state| state.dirty_chunks.clear());
        if memory_level != MemoryLevel::Gpu {
            for chunkey in &chunkeys {
                catalog
                    .data_mgr()
                    .delete_chunks_with_prefix(&(*chunkey).into(), MemoryLevel::Gpu);
            }
        }
        info!(
            "committed update: table={}, fragments={}, dirty_chunks={}",
            td.table_name,
            keys.len(),
            chunkeys.len()
        );
        Ok(())
    }

    /// Throw away staged work. Dirty buffers are freed only when the
    /// mutation did not run at the table's authoritative level; in-place
    /// mutation of the authoritative copy cannot be rolled back.
    pub fn cancel_update(&self) -> Result<(), String> {
        let catalog = self.with_state(|state| state.catalog.clone());
        let Some(catalog) = catalog else {
            return Ok(());
        };
        let (logical_table_id, memory_level) =
            self.with_state(|state| (state.logical_table_id, state.memory_level));
        let td = catalog.get_metadata_for_table_by_id(logical_table_id)?;
        if td.persistence_level != memory_level {
            self.with_state(|state| {
                for (key, chunk) in state.dirty_chunks.iter_mut() {
                    catalog.data_mgr().free_chunk(*key);
                    chunk.clear_buffers();
                }
            });
            debug!(
                "cancelled update: table={}, released_chunks={}",
                td.table_name,
                self.dirty_chunk_count()
            );
        }
        Ok(())
    }
}
