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
//! Buffer manager: chunk materialization, eviction and checkpointing.
//!
//! CPU buffers are the mutable working copies; the GPU level is tracked
//! as a residency set so commits can fan out evictions; the disk level
//! holds crc32c-guarded chunk images written by `checkpoint_table`.
//!
//! Current limitations:
//! - GPU residency is bookkeeping only; no device memory is managed.
//! - Disk images are one file per buffer, not a packed segment file.

pub mod buffer;
pub mod chunk;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::common::ids::{ChunkKey, ChunkKeyPrefix};
use buffer::{BufferRef, ChunkBuffer, ChunkMetadata, Encoder, StatsKind};

/// Storage hierarchy level of a buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryLevel {
    Disk,
    Cpu,
    Gpu,
}

struct CpuSlot {
    data: BufferRef,
    index: Option<BufferRef>,
}

pub struct DataMgr {
    data_dir: PathBuf,
    cpu: Mutex<HashMap<ChunkKey, CpuSlot>>,
    gpu: Mutex<BTreeSet<ChunkKey>>,
    epochs: Mutex<HashMap<i32, u64>>,
}

impl DataMgr {
    pub fn new(data_dir: PathBuf) -> Result<Arc<Self>, String> {
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            format!(
                "create data dir failed: dir={}, error={}",
                data_dir.display(),
                e
            )
        })?;
        Ok(Arc::new(Self {
            data_dir,
            cpu: Mutex::new(HashMap::new()),
            gpu: Mutex::new(BTreeSet::new()),
            epochs: Mutex::new(HashMap::new()),
        }))
    }

    /// Register a freshly built CPU chunk (the insert path). The buffer
    /// starts dirty so the next checkpoint persists it.
    pub(crate) fn create_chunk(
        &self,
        key: ChunkKey,
        data: Vec<u8>,
        index: Option<Vec<u8>>,
        encoder: Encoder,
    ) -> (BufferRef, Option<BufferRef>) {
        let mut data_buf = ChunkBuffer::new(data, encoder);
        data_buf.set_updated();
        let data_ref = data_buf.into_ref();
        let index_ref = index.map(|bytes| {
            let mut buf = ChunkBuffer::new(bytes, Encoder::new(StatsKind::None));
            buf.set_updated();
            buf.into_ref()
        });
        let mut cpu = self.cpu.lock().expect("cpu buffer map lock");
        cpu.insert(
            key,
            CpuSlot {
                data: Arc::clone(&data_ref),
                index: index_ref.as_ref().map(Arc::clone),
            },
        );
        (data_ref, index_ref)
    }

    /// Return the CPU buffers for `key`, reading the disk image if the
    /// chunk is not resident. The encoder is seeded from `meta`, the
    /// authoritative statistics the fragment holds for this chunk.
    pub(crate) fn get_or_materialize(
        &self,
        key: ChunkKey,
        meta: &ChunkMetadata,
        kind: StatsKind,
        varlen: bool,
    ) -> Result<(BufferRef, Option<BufferRef>), String> {
        {
            let cpu = self.cpu.lock().expect("cpu buffer map lock");
            if let Some(slot) = cpu.get(&key) {
                return Ok((Arc::clone(&slot.data), slot.index.as_ref().map(Arc::clone)));
            }
        }

        let (data_path, index_path) = self.chunk_file_paths(key);
        if !data_path.exists() {
            return Err(format!(
                "chunk is not materializable: key={}, no CPU buffer and no disk image at {}",
                key,
                data_path.display()
            ));
        }
        let data = read_image(&data_path)?;
        if data.len() != meta.num_bytes {
            return Err(format!(
                "chunk disk image size mismatch: key={}, expected_bytes={}, actual_bytes={}",
                key,
                meta.num_bytes,
                data.len()
            ));
        }
        let index = if varlen {
            Some(read_image(&index_path)?)
        } else {
            None
        };
        debug!("materialized chunk {} from disk image", key);

        let data_ref = ChunkBuffer::new(data, Encoder::from_metadata(kind, meta)).into_ref();
        let index_ref =
            index.map(|bytes| ChunkBuffer::new(bytes, Encoder::new(StatsKind::None)).into_ref());
        let mut cpu = self.cpu.lock().expect("cpu buffer map lock");
        let slot = cpu.entry(key).or_insert(CpuSlot {
            data: Arc::clone(&data_ref),
            index: index_ref.as_ref().map(Arc::clone),
        });
        Ok((Arc::clone(&slot.data), slot.index.as_ref().map(Arc::clone)))
    }

    /// Drop the CPU residency of a chunk. Outstanding strong handles keep
    /// the allocation alive until they are released.
    pub(crate) fn free_chunk(&self, key: ChunkKey) {
        let mut cpu = self.cpu.lock().expect("cpu buffer map lock");
        if cpu.remove(&key).is_some() {
            debug!("freed CPU buffers for chunk {}", key);
        }
    }

    pub fn delete_chunks_with_prefix(&self, prefix: &ChunkKeyPrefix, level: MemoryLevel) {
        match level {
            MemoryLevel::Gpu => {
                let mut gpu = self.gpu.lock().expect("gpu residency lock");
                let before = gpu.len();
                gpu.retain(|key| !key.matches_prefix(prefix));
                let evicted = before - gpu.len();
                if evicted > 0 {
                    debug!("evicted {} stale GPU chunk(s) for prefix", evicted);
                }
            }
            MemoryLevel::Cpu => {
                let mut cpu = self.cpu.lock().expect("cpu buffer map lock");
                cpu.retain(|key, _| !key.matches_prefix(prefix));
            }
            MemoryLevel::Disk => {
                warn!("delete_chunks_with_prefix is not supported at disk level");
            }
        }
    }

    /// Note a chunk as resident on the GPU. The execution engine does this
    /// when it uploads a chunk; the update path only ever evicts.
    pub fn mark_gpu_resident(&self, key: ChunkKey) {
        self.gpu.lock().expect("gpu residency lock").insert(key);
    }

    pub fn is_gpu_resident(&self, key: ChunkKey) -> bool {
        self.gpu.lock().expect("gpu residency lock").contains(&key)
    }

    /// Write every dirty CPU buffer of `table_id` to its disk image and
    /// advance the table epoch.
    pub(crate) fn checkpoint_table(&self, table_id: i32) -> Result<u64, String> {
        let cpu = self.cpu.lock().expect("cpu buffer map lock");
        let mut flushed = 0usize;
        for (key, slot) in cpu.iter() {
            if key.table_id != table_id {
                continue;
            }
            let (data_path, index_path) = self.chunk_file_paths(*key);
            {
                let mut data = slot.data.lock().expect("chunk buffer lock");
                if data.is_updated() {
                    write_image(&data_path, data.mem())?;
                    data.clear_updated();
                    flushed += 1;
                }
            }
            if let Some(index) = slot.index.as_ref() {
                let mut index = index.lock().expect("chunk index buffer lock");
                if index.is_updated() {
                    write_image(&index_path, index.mem())?;
                    index.clear_updated();
                }
            }
        }
        drop(cpu);

        let mut epochs = self.epochs.lock().expect("table epoch lock");
        let epoch = epochs.entry(table_id).or_insert(0);
        *epoch += 1;
        info!(
            "checkpointed table {}: flushed_chunks={}, epoch={}",
            table_id, flushed, *epoch
        );
        Ok(*epoch)
    }

    pub fn table_epoch(&self, table_id: i32) -> u64 {
        self.epochs
            .lock()
            .expect("table epoch lock")
            .get(&table_id)
            .copied()
            .unwrap_or(0)
    }

    fn chunk_file_paths(&self, key: ChunkKey) -> (PathBuf, PathBuf) {
        let stem = format!(
            "chunk_{}_{}_{}_{}",
            key.db_id, key.table_id, key.column_id, key.fragment_id
        );
        (
            self.data_dir.join(format!("{stem}.data")),
            self.data_dir.join(format!("{stem}.idx")),
        )
    }
}

/// Disk image layout: 4-byte little-endian crc32c of the payload, then
/// the payload bytes.
fn write_image(path: &PathBuf, payload: &[u8]) -> Result<(), String> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    out.extend_from_slice(payload);
    std::fs::write(path, out)
        .map_err(|e| format!("write chunk image failed: path={}, error={}", path.display(), e))
}

fn read_image(path: &PathBuf) -> Result<Vec<u8>, String> {
    let raw = std::fs::read(path)
        .map_err(|e| format!("read chunk image failed: path={}, error={}", path.display(), e))?;
    if raw.len() < 4 {
        return Err(format!(
            "chunk image too small: path={}, size={}",
            path.display(),
            raw.len()
        ));
    }
    let stored = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let payload = raw[4..].to_vec();
    let actual = crc32c::crc32c(&payload);
    if stored != actual {
        return Err(format!(
            "chunk image checksum mismatch: path={}, stored={:#010x}, actual={:#010x}",
            path.display(),
            stored,
            actual
        ));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::buffer::{ChunkStatsValue, Encoder, StatsKind};
    use super::*;

    fn test_mgr() -> (tempfile::TempDir, Arc<DataMgr>) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mgr = DataMgr::new(dir.path().to_path_buf()).expect("create data mgr");
        (dir, mgr)
    }

    #[test]
    fn checkpoint_then_materialize_round_trips_payload() {
        let (_dir, mgr) = test_mgr();
        let key = ChunkKey::new(1, 2, 1, 0);
        let mut encoder = Encoder::new(StatsKind::Int);
        encoder.set_num_elems(3);
        encoder.update_stats_i64(1, false);
        encoder.update_stats_i64(9, false);
        let payload = vec![7u8; 24];
        let (data_ref, _) = mgr.create_chunk(key, payload.clone(), None, encoder);
        let meta = {
            let buf = data_ref.lock().expect("chunk buffer lock");
            buf.encoder.metadata(buf.size())
        };
        assert_eq!(mgr.checkpoint_table(2).expect("checkpoint"), 1);

        mgr.free_chunk(key);
        drop(data_ref);
        let (restored, index) = mgr
            .get_or_materialize(key, &meta, StatsKind::Int, false)
            .expect("materialize from disk");
        assert!(index.is_none());
        let buf = restored.lock().expect("chunk buffer lock");
        assert_eq!(buf.mem(), payload.as_slice());
        assert!(!buf.is_updated());
        assert_eq!(
            buf.encoder.metadata(buf.size()).stats,
            ChunkStatsValue::Int { min: 1, max: 9 }
        );
    }

    #[test]
    fn materialize_without_residency_or_image_fails() {
        let (_dir, mgr) = test_mgr();
        let key = ChunkKey::new(1, 2, 1, 0);
        let err = mgr
            .get_or_materialize(key, &ChunkMetadata::empty(), StatsKind::Int, false)
            .expect_err("missing chunk should fail");
        assert!(err.contains("not materializable"), "err={err}");
    }

    #[test]
    fn corrupt_image_is_rejected() {
        let (dir, mgr) = test_mgr();
        let key = ChunkKey::new(1, 2, 1, 0);
        let (data_ref, _) = mgr.create_chunk(key, vec![1, 2, 3, 4], None, Encoder::new(StatsKind::Int));
        let meta = {
            let buf = data_ref.lock().expect("chunk buffer lock");
            buf.encoder.metadata(buf.size())
        };
        mgr.checkpoint_table(2).expect("checkpoint");
        mgr.free_chunk(key);

        let path = dir.path().join("chunk_1_2_1_0.data");
        let mut raw = std::fs::read(&path).expect("read image");
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).expect("rewrite image");

        let meta = ChunkMetadata {
            num_bytes: 4,
            ..meta
        };
        let err = mgr
            .get_or_materialize(key, &meta, StatsKind::Int, false)
            .expect_err("corrupt image should fail");
        assert!(err.contains("checksum mismatch"), "err={err}");
    }

    #[test]
    fn gpu_eviction_honors_prefix() {
        let (_dir, mgr) = test_mgr();
        let a = ChunkKey::new(1, 2, 1, 0);
        let b = ChunkKey::new(1, 3, 1, 0);
        mgr.mark_gpu_resident(a);
        mgr.mark_gpu_resident(b);
        mgr.delete_chunks_with_prefix(&a.into(), MemoryLevel::Gpu);
        assert!(!mgr.is_gpu_resident(a));
        assert!(mgr.is_gpu_resident(b));
    }
}
