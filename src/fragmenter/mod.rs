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
//! Fragment registry and the update/vacuum entry points.
//!
//! One `Fragmenter` per table owns the table's fragments. Fragment
//! metadata is read under the registry's shared lock; publication of a
//! transaction's shadow metadata takes the exclusive lock, which is the
//! linearization point between concurrent statements.

mod mutator;
pub mod update;
pub mod updel_roll;
pub mod vacuum;

pub use mutator::ChunkUpdateStats;
pub use updel_roll::{MetaDataKey, UpdelRoll};

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::catalog::{Catalog, TableDescriptor};
use crate::common::config::unconditional_vacuum_default;
use crate::common::ids::ChunkKey;
use crate::datamgr::MemoryLevel;
use crate::datamgr::buffer::{ChunkMetadata, Encoder, StatsKind, stats_kind_for};
use crate::datamgr::chunk::Chunk;
use crate::fragmenter::mutator::{read_scalar_f64, read_scalar_i64};
use crate::types::SqlTypeInfo;

/// Per-fragment map from column id to that chunk's metadata.
pub type ChunkMetadataMap = BTreeMap<i32, ChunkMetadata>;

#[derive(Clone, Debug)]
pub struct FragmentInfo {
    pub fragment_id: i32,
    pub physical_num_tuples: usize,
    pub shadow_num_tuples: usize,
    pub chunk_metadata_map: ChunkMetadataMap,
    pub shadow_chunk_metadata_map: ChunkMetadataMap,
}

/// Column payload handed to `insert_fragment`. Fixed-width columns are
/// element-size-aligned raw bytes; offset-indexed columns carry the data
/// bytes plus `nrows + 1` offsets ending at the data size.
pub enum FragmentColumnData {
    Fixed { data: Vec<u8> },
    Varlen { data: Vec<u8>, offsets: Vec<i32> },
}

pub struct Fragmenter {
    table_id: i32,
    fragments: RwLock<Vec<FragmentInfo>>,
    unconditional_vacuum: AtomicBool,
}

impl Fragmenter {
    pub fn new(table_id: i32) -> Self {
        Self {
            table_id,
            fragments: RwLock::new(Vec::new()),
            unconditional_vacuum: AtomicBool::new(unconditional_vacuum_default()),
        }
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    /// Test hook: force a synchronous vacuum on every delete-column
    /// update.
    pub fn set_unconditional_vacuum(&self, on: bool) {
        self.unconditional_vacuum.store(on, Ordering::Relaxed);
    }

    pub fn unconditional_vacuum(&self) -> bool {
        self.unconditional_vacuum.load(Ordering::Relaxed)
    }

    pub fn num_fragments(&self) -> usize {
        self.fragments.read().expect("fragment registry lock").len()
    }

    /// Snapshot of one fragment. Fails when the fragment does not exist.
    pub fn get_fragment_info(&self, fragment_id: i32) -> Result<FragmentInfo, String> {
        let fragments = self.fragments.read().expect("fragment registry lock");
        fragments
            .iter()
            .find(|f| f.fragment_id == fragment_id)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "fragment does not exist: table_id={}, fragment_id={}",
                    self.table_id, fragment_id
                )
            })
    }

    pub fn physical_num_tuples(&self, fragment_id: i32) -> Result<usize, String> {
        Ok(self.get_fragment_info(fragment_id)?.physical_num_tuples)
    }

    pub(crate) fn chunk_metadata_for(
        &self,
        fragment_id: i32,
        column_id: i32,
    ) -> Result<ChunkMetadata, String> {
        let info = self.get_fragment_info(fragment_id)?;
        info.chunk_metadata_map.get(&column_id).cloned().ok_or_else(|| {
            format!(
                "chunk metadata missing: table_id={}, fragment_id={}, column_id={}",
                self.table_id, fragment_id, column_id
            )
        })
    }

    /// Live metadata map and shadow tuple count, as the first-touch
    /// snapshot for a transaction roll.
    pub(crate) fn metadata_snapshot(
        &self,
        fragment_id: i32,
    ) -> Result<(ChunkMetadataMap, usize), String> {
        let info = self.get_fragment_info(fragment_id)?;
        Ok((info.chunk_metadata_map, info.shadow_num_tuples))
    }

    /// Materialize one pinned chunk per non-virtual column, column-id
    /// ordered.
    pub fn get_chunks_for_all_columns(
        &self,
        catalog: &Catalog,
        td: &TableDescriptor,
        fragment_id: i32,
        memory_level: MemoryLevel,
    ) -> Result<Vec<Chunk>, String> {
        let (metadata, _) = self.metadata_snapshot(fragment_id)?;
        let mut chunks = Vec::new();
        let mut ncol = 0;
        let mut col_id = 1;
        while ncol < td.n_columns {
            if let Some(cd) = catalog.get_metadata_for_column(td.table_id, col_id) {
                ncol += 1;
                if !cd.is_virtual_col {
                    let meta = metadata.get(&cd.column_id).ok_or_else(|| {
                        format!(
                            "chunk metadata missing: table={}, column_id={}, fragment_id={}",
                            td.table_name, cd.column_id, fragment_id
                        )
                    })?;
                    let key =
                        ChunkKey::new(catalog.db_id(), td.table_id, cd.column_id, fragment_id);
                    chunks.push(Chunk::get_chunk(
                        &cd,
                        catalog.data_mgr(),
                        key,
                        memory_level,
                        meta,
                    )?);
                }
            }
            col_id += 1;
        }
        Ok(chunks)
    }

    /// Publish a transaction's shadow metadata for `key` into the live
    /// fragment, atomically under the registry's exclusive lock.
    pub fn update_metadata(
        &self,
        _catalog: &Catalog,
        key: MetaDataKey,
        roll: &UpdelRoll,
    ) -> Result<(), String> {
        let Some((shadow_map, shadow_num_tuples)) = roll.shadow_for(key) else {
            return Ok(());
        };
        let mut fragments = self.fragments.write().expect("fragment registry lock");
        let fragment = fragments
            .iter_mut()
            .find(|f| f.fragment_id == key.1)
            .ok_or_else(|| {
                format!(
                    "fragment does not exist: table_id={}, fragment_id={}",
                    self.table_id, key.1
                )
            })?;
        fragment.shadow_chunk_metadata_map = shadow_map.clone();
        fragment.chunk_metadata_map = shadow_map;
        if let Some(num_tuples) = shadow_num_tuples {
            fragment.shadow_num_tuples = num_tuples;
            fragment.physical_num_tuples = num_tuples;
        }
        Ok(())
    }

    /// Build the chunks of a new fragment from raw column payloads,
    /// computing the initial per-chunk statistics the way the insert
    /// path does. The delete column may be omitted and defaults to
    /// all-clear flags.
    pub fn insert_fragment(
        &self,
        catalog: &Catalog,
        td: &TableDescriptor,
        columns: &mut BTreeMap<i32, FragmentColumnData>,
    ) -> Result<i32, String> {
        if td.table_id != self.table_id {
            return Err(format!(
                "fragmenter/table mismatch: fragmenter_table_id={}, table_id={}",
                self.table_id, td.table_id
            ));
        }
        let mut nrows: Option<usize> = None;
        let mut metadata_map = ChunkMetadataMap::new();
        let mut built: Vec<(i32, Vec<u8>, Option<Vec<u8>>, Encoder)> = Vec::new();

        let mut ncol = 0;
        let mut col_id = 1;
        while ncol < td.n_columns {
            let Some(cd) = catalog.get_metadata_for_column(td.table_id, col_id) else {
                col_id += 1;
                continue;
            };
            ncol += 1;
            col_id += 1;
            if cd.is_virtual_col {
                continue;
            }
            let ty = cd.column_type;
            let payload = match columns.remove(&cd.column_id) {
                Some(payload) => payload,
                None if cd.is_deleted_col => FragmentColumnData::Fixed {
                    data: vec![0u8; nrows.unwrap_or(0)],
                },
                None => {
                    return Err(format!(
                        "fragment payload missing for column: table={}, column={}",
                        td.table_name, cd.column_name
                    ));
                }
            };
            match payload {
                FragmentColumnData::Fixed { data } => {
                    let elem = ty.element_size().max(1);
                    if data.len() % elem != 0 {
                        return Err(format!(
                            "fixed column payload is not element aligned: column={}, bytes={}, element_size={}",
                            cd.column_name,
                            data.len(),
                            elem
                        ));
                    }
                    let col_rows = data.len() / elem;
                    check_row_count(&mut nrows, col_rows, &cd.column_name)?;
                    let mut encoder = Encoder::new(stats_kind_for(&ty));
                    encoder.set_num_elems(col_rows);
                    scan_fixed_stats(&data, &ty, &mut encoder);
                    metadata_map.insert(cd.column_id, encoder.metadata(data.len()));
                    built.push((cd.column_id, data, None, encoder));
                }
                FragmentColumnData::Varlen { data, offsets } => {
                    if !ty.is_varlen_indeed() {
                        return Err(format!(
                            "varlen payload for a fixed-width column: column={}",
                            cd.column_name
                        ));
                    }
                    if offsets.is_empty() || *offsets.last().expect("nonempty") as usize != data.len()
                    {
                        return Err(format!(
                            "varlen offsets must end at the data size: column={}, data_bytes={}",
                            cd.column_name,
                            data.len()
                        ));
                    }
                    if offsets.windows(2).any(|w| w[0] > w[1]) {
                        return Err(format!(
                            "varlen offsets must be non-decreasing: column={}",
                            cd.column_name
                        ));
                    }
                    let col_rows = offsets.len() - 1;
                    check_row_count(&mut nrows, col_rows, &cd.column_name)?;
                    let mut encoder = Encoder::new(StatsKind::None);
                    encoder.set_num_elems(col_rows);
                    metadata_map.insert(cd.column_id, encoder.metadata(data.len()));
                    let mut index_bytes = Vec::with_capacity(offsets.len() * 4);
                    for off in &offsets {
                        index_bytes.extend_from_slice(&off.to_le_bytes());
                    }
                    built.push((cd.column_id, data, Some(index_bytes), encoder));
                }
            }
        }
        if !columns.is_empty() {
            return Err(format!(
                "fragment payload names unknown column ids: table={}, column_ids={:?}",
                td.table_name,
                columns.keys().collect::<Vec<_>>()
            ));
        }
        let nrows = nrows.unwrap_or(0);

        let mut fragments = self.fragments.write().expect("fragment registry lock");
        let fragment_id = fragments.len() as i32;
        for (column_id, data, index, encoder) in built {
            let key = ChunkKey::new(catalog.db_id(), td.table_id, column_id, fragment_id);
            catalog.data_mgr().create_chunk(key, data, index, encoder);
        }
        fragments.push(FragmentInfo {
            fragment_id,
            physical_num_tuples: nrows,
            shadow_num_tuples: nrows,
            chunk_metadata_map: metadata_map.clone(),
            shadow_chunk_metadata_map: metadata_map,
        });
        Ok(fragment_id)
    }
}

fn check_row_count(nrows: &mut Option<usize>, col_rows: usize, column: &str) -> Result<(), String> {
    match nrows {
        Some(expected) if *expected != col_rows => Err(format!(
            "fragment column row count mismatch: column={}, expected_rows={}, actual_rows={}",
            column, expected, col_rows
        )),
        Some(_) => Ok(()),
        None => {
            *nrows = Some(col_rows);
            Ok(())
        }
    }
}

/// Fold every element of a freshly inserted fixed-width column into the
/// chunk encoder.
fn scan_fixed_stats(data: &[u8], ty: &SqlTypeInfo, encoder: &mut Encoder) {
    let elem = ty.element_size().max(1);
    let can_be_null = !ty.notnull;
    match encoder.stats_kind() {
        StatsKind::Int => {
            for chunk in data.chunks_exact(elem) {
                let (v, is_null) = read_scalar_i64(chunk, ty);
                if is_null {
                    encoder.update_has_null(can_be_null);
                } else {
                    encoder.update_stats_i64(v, false);
                }
            }
        }
        StatsKind::Fp => {
            for chunk in data.chunks_exact(elem) {
                let (v, is_null) = read_scalar_f64(chunk, ty);
                if is_null {
                    encoder.update_has_null(can_be_null);
                } else {
                    encoder.update_stats_f64(v, false);
                }
            }
        }
        StatsKind::None => {
            if ty.is_fixlen_array() {
                for chunk in data.chunks_exact(elem) {
                    encoder.update_array_metadata(chunk);
                }
            }
        }
    }
}
