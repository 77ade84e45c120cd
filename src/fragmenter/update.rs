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
//! Per-column updater: the parallel in-place UPDATE scan.
//!
//! One call updates one column of one fragment from an RHS value stream,
//! either positional (one value per row offset) or broadcast (one value
//! for all offsets). Row offsets are partitioned into contiguous
//! segments, one worker per segment, each folding its writes into
//! per-worker statistics that reduce into the chunk-level summary after
//! the join.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Catalog, ColumnDescriptor, TableDescriptor};
use crate::common::config::update_worker_threads;
use crate::common::ids::ChunkKey;
use crate::datamgr::MemoryLevel;
use crate::datamgr::chunk::Chunk;
use crate::fragmenter::mutator::{ChunkUpdateStats, RawChunkSlice, UpdateContext, write_element};
use crate::fragmenter::updel_roll::UpdelRoll;
use crate::fragmenter::Fragmenter;
use crate::types::{ScalarValue, SqlTypeInfo, pow10_i64};

/// Name-resolving convenience entry: `UPDATE <table> SET <column> = ...`.
pub fn update_column_by_name(
    catalog: &Arc<Catalog>,
    table_name: &str,
    column_name: &str,
    fragment_id: i32,
    frag_offsets: &[u64],
    rhs_values: &[ScalarValue],
    rhs_type: &SqlTypeInfo,
    memory_level: MemoryLevel,
    roll: &UpdelRoll,
) -> Result<(), String> {
    let td = catalog.get_metadata_for_table(table_name)?;
    let cd = catalog.get_metadata_for_column_by_name(td.table_id, column_name)?;
    td.fragmenter.update_column(
        catalog,
        &td,
        &cd,
        fragment_id,
        frag_offsets,
        rhs_values,
        rhs_type,
        memory_level,
        roll,
    )
}

impl Fragmenter {
    /// Broadcast one RHS value to every offset.
    #[allow(clippy::too_many_arguments)]
    pub fn update_column_broadcast(
        &self,
        catalog: &Arc<Catalog>,
        td: &Arc<TableDescriptor>,
        cd: &Arc<ColumnDescriptor>,
        fragment_id: i32,
        frag_offsets: &[u64],
        rhs_value: ScalarValue,
        rhs_type: &SqlTypeInfo,
        memory_level: MemoryLevel,
        roll: &UpdelRoll,
    ) -> Result<(), String> {
        self.update_column(
            catalog,
            td,
            cd,
            fragment_id,
            frag_offsets,
            &[rhs_value],
            rhs_type,
            memory_level,
            roll,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_column(
        &self,
        catalog: &Arc<Catalog>,
        td: &Arc<TableDescriptor>,
        cd: &Arc<ColumnDescriptor>,
        fragment_id: i32,
        frag_offsets: &[u64],
        rhs_values: &[ScalarValue],
        rhs_type: &SqlTypeInfo,
        memory_level: MemoryLevel,
        roll: &UpdelRoll,
    ) -> Result<(), String> {
        if td.table_id != self.table_id() {
            return Err(format!(
                "fragmenter/table mismatch: fragmenter_table_id={}, table_id={}",
                self.table_id(),
                td.table_id
            ));
        }
        let logical_table_id = catalog.get_logical_table_id(td.table_id)?;
        roll.record_statement(catalog, logical_table_id, memory_level);

        let nrow = frag_offsets.len();
        if nrow == 0 {
            return Ok(());
        }
        let n_rhs = rhs_values.len();
        if nrow != n_rhs && n_rhs != 1 {
            return Err(format!(
                "rhs value count mismatch: table={}, column={}, rows={}, rhs_values={}",
                td.table_name, cd.column_name, nrow, n_rhs
            ));
        }

        let chunk_meta = self.chunk_metadata_for(fragment_id, cd.column_id)?;
        let chunk_key = ChunkKey::new(catalog.db_id(), td.table_id, cd.column_id, fragment_id);
        let chunk = Chunk::get_chunk(
            cd,
            catalog.data_mgr(),
            chunk_key,
            MemoryLevel::Cpu,
            &chunk_meta,
        )?;

        // On a shard the column's dictionary id is zero; the logical
        // table's descriptor carries the authoritative one.
        let cdl = if td.shard < 0 {
            Arc::clone(cd)
        } else {
            catalog
                .get_metadata_for_column(logical_table_id, cd.column_id)
                .ok_or_else(|| {
                    format!(
                        "logical column descriptor missing: logical_table_id={}, column_id={}",
                        logical_table_id, cd.column_id
                    )
                })?
        };
        let lhs_type = cd.column_type;
        let lhs_dict = if lhs_type.is_string() {
            if !lhs_type.is_dict_string() {
                return Err(format!(
                    "update requires a dictionary-encoded string column: column={}",
                    cd.column_name
                ));
            }
            let dict_id = cdl.column_type.comp_param;
            let desc = catalog.get_metadata_for_dict(dict_id).ok_or_else(|| {
                format!(
                    "dictionary does not exist: dict_id={}, column={}",
                    dict_id, cd.column_name
                )
            })?;
            Some(Arc::clone(&desc.dict))
        } else {
            None
        };
        let rhs_dict = if rhs_type.is_string() {
            catalog
                .get_metadata_for_dict(rhs_type.comp_param)
                .map(|d| Arc::clone(&d.dict))
        } else {
            None
        };

        roll.add_dirty_chunk(
            chunk.clone(),
            ChunkKey::new(catalog.db_id(), cd.table_id, cd.column_id, fragment_id),
        );

        let ncore = update_worker_threads();
        let segsz = nrow.div_ceil(ncore);
        let ctx = UpdateContext {
            lhs_type,
            rhs_type: *rhs_type,
            column_name: &cd.column_name,
            lhs_dict,
            rhs_dict,
        };

        let mut chunk_stats = ChunkUpdateStats::new();
        {
            let dbuf = chunk.buffer()?;
            let mut guard = dbuf.lock().expect("chunk buffer lock");
            guard.set_updated();
            let (base, len) = guard.raw_parts_mut();
            let view = RawChunkSlice::new(base, len);

            // At most `ncore` contiguous segments; the scope joins them
            // all before more work is admitted.
            let results: Vec<Result<ChunkUpdateStats, String>> = std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(ncore);
                let mut rbegin = 0usize;
                while rbegin < nrow {
                    let rend = (rbegin + segsz).min(nrow);
                    let offsets = &frag_offsets[rbegin..rend];
                    let seg_base = rbegin;
                    let ctx = &ctx;
                    handles.push(scope.spawn(move || {
                        let mut stats = ChunkUpdateStats::new();
                        for (i, row_offset) in offsets.iter().enumerate() {
                            let value = if n_rhs == 1 {
                                &rhs_values[0]
                            } else {
                                &rhs_values[seg_base + i]
                            };
                            write_element(view, *row_offset, value, ctx, &mut stats)?;
                        }
                        Ok(stats)
                    }));
                    rbegin = rend;
                }
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err("update worker panicked".to_string()))
                    })
                    .collect()
            });
            drop(guard);

            // First worker error wins; all peers have joined already.
            for result in results {
                chunk_stats.merge(&result?);
            }
        }

        if self.unconditional_vacuum() && cd.is_deleted_col {
            let deleted_offsets = self.get_vacuum_offsets(&chunk)?;
            if !deleted_offsets.is_empty() {
                debug!(
                    "unconditional vacuum after delete-column update: table={}, fragment_id={}, deleted_rows={}",
                    td.table_name,
                    fragment_id,
                    deleted_offsets.len()
                );
                return self.compact_rows(
                    catalog,
                    td,
                    fragment_id,
                    &deleted_offsets,
                    memory_level,
                    roll,
                );
            }
        }

        self.update_column_metadata(
            catalog,
            td,
            cd.as_ref(),
            fragment_id,
            &chunk,
            &chunk_stats,
            rhs_type,
            roll,
        )
    }

    /// Offsets of rows whose delete flag is set, scanned from a delete
    /// column's chunk.
    pub fn get_vacuum_offsets(&self, chunk: &Chunk) -> Result<Vec<u64>, String> {
        let dbuf = chunk.buffer()?;
        let guard = dbuf.lock().expect("chunk buffer lock");
        Ok(guard
            .mem()
            .iter()
            .enumerate()
            .filter(|(_, flag)| **flag != 0)
            .map(|(row, _)| row as u64)
            .collect())
    }

    /// Fold the reduced chunk statistics into the chunk's encoder and
    /// stage the emitted metadata into the roll's shadow map, snapshotting
    /// the fragment's live state on first touch.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update_column_metadata(
        &self,
        _catalog: &Arc<Catalog>,
        td: &Arc<TableDescriptor>,
        cd: &ColumnDescriptor,
        fragment_id: i32,
        chunk: &Chunk,
        stats: &ChunkUpdateStats,
        rhs_type: &SqlTypeInfo,
        roll: &UpdelRoll,
    ) -> Result<(), String> {
        let key = (td.table_id, fragment_id);
        let (live_metadata, shadow_num_tuples) = self.metadata_snapshot(fragment_id)?;
        let lhs = cd.column_type;
        let dbuf = chunk.buffer()?;
        roll.with_state(|state| {
            state
                .chunk_metadata
                .entry(key)
                .or_insert_with(|| live_metadata.clone());
            state.num_tuples.entry(key).or_insert(shadow_num_tuples);

            let mut buf = dbuf.lock().expect("chunk buffer lock");
            if lhs.is_integral() || (lhs.is_decimal() && rhs_type.is_decimal()) {
                if stats.has_i64() {
                    buf.encoder.update_stats_i64(stats.max_i64, stats.has_null);
                    buf.encoder.update_stats_i64(stats.min_i64, stats.has_null);
                } else {
                    buf.encoder.update_has_null(stats.has_null);
                }
            } else if lhs.is_fp() {
                if stats.has_f64() {
                    buf.encoder.update_stats_f64(stats.max_f64, stats.has_null);
                    buf.encoder.update_stats_f64(stats.min_f64, stats.has_null);
                } else {
                    buf.encoder.update_has_null(stats.has_null);
                }
            } else if lhs.is_decimal() {
                // Decimal written through doubles: scale back into the
                // stored integer domain.
                if stats.has_f64() {
                    let scale = pow10_i64(lhs.scale) as f64;
                    buf.encoder
                        .update_stats_i64((stats.max_f64 * scale) as i64, stats.has_null);
                    buf.encoder
                        .update_stats_i64((stats.min_f64 * scale) as i64, stats.has_null);
                } else {
                    buf.encoder.update_has_null(stats.has_null);
                }
            } else if !lhs.is_fixlen_array() && !(lhs.is_string() && !lhs.is_dict_string()) {
                if stats.has_i64() {
                    buf.encoder.update_stats_i64(stats.max_i64, stats.has_null);
                    buf.encoder.update_stats_i64(stats.min_i64, stats.has_null);
                } else {
                    buf.encoder.update_has_null(stats.has_null);
                }
            }
            // Arrays and none-encoded strings only refresh byte/element
            // counts through the emitted metadata.
            let meta = buf.encoder.metadata(buf.size());
            state
                .chunk_metadata
                .get_mut(&key)
                .expect("shadow metadata just inserted")
                .insert(cd.column_id, meta);
        });
        Ok(())
    }
}
