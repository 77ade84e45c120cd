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
//! Fragment vacuumer: in-place compaction of deleted rows.
//!
//! Every chunk of the fragment is rewritten by sliding retained byte
//! blocks toward the front. Fixed-width chunks move whole element runs;
//! offset-indexed chunks move the data bytes, rebase the retained
//! offsets and compact the offset array itself with the same two-cursor
//! walk. Chunks are vacuumed in parallel, at most one worker batch in
//! flight.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Catalog, TableDescriptor};
use crate::common::config::update_worker_threads;
use crate::datamgr::MemoryLevel;
use crate::datamgr::buffer::ChunkBuffer;
use crate::datamgr::chunk::Chunk;
use crate::fragmenter::Fragmenter;
use crate::fragmenter::mutator::{ChunkUpdateStats, read_scalar_f64, read_scalar_i64};
use crate::fragmenter::updel_roll::UpdelRoll;

impl Fragmenter {
    /// Permanently remove the rows at `frag_offsets` (strictly
    /// increasing, in-range) from every non-virtual column of the
    /// fragment, staging the new sizes and statistics on `roll`.
    pub fn compact_rows(
        &self,
        catalog: &Arc<Catalog>,
        td: &Arc<TableDescriptor>,
        fragment_id: i32,
        frag_offsets: &[u64],
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

        let nrows_to_vacuum = frag_offsets.len();
        if nrows_to_vacuum == 0 {
            return Ok(());
        }
        let nrows_in_fragment = self.physical_num_tuples(fragment_id)?;
        validate_deleted_offsets(frag_offsets, nrows_in_fragment, td, fragment_id)?;
        let nrows_to_keep = nrows_in_fragment - nrows_to_vacuum;

        let column_chunks =
            self.get_chunks_for_all_columns(catalog, td, fragment_id, memory_level)?;

        // Mutation is imminent for every chunk; pin them on the roll now
        // so a failed worker still leaves the statement cancellable.
        for chunk in &column_chunks {
            roll.add_dirty_chunk(chunk.clone(), chunk.key());
        }

        let ncore = update_worker_threads().max(1);
        let mut column_stats: Vec<ChunkUpdateStats> = Vec::with_capacity(column_chunks.len());
        for batch in column_chunks.chunks(ncore) {
            let results: Vec<Result<ChunkUpdateStats, String>> = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|chunk| {
                        scope.spawn(move || {
                            vacuum_one_chunk(chunk, frag_offsets, nrows_in_fragment, nrows_to_keep)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err("vacuum worker panicked".to_string()))
                    })
                    .collect()
            });
            for result in results {
                column_stats.push(result?);
            }
        }

        // Stage the post-vacuum sizes and tuple count.
        let (live_metadata, _) = self.metadata_snapshot(fragment_id)?;
        let key = (td.table_id, fragment_id);
        roll.with_state(|state| -> Result<(), String> {
            state
                .chunk_metadata
                .entry(key)
                .or_insert_with(|| live_metadata.clone());
            state.num_tuples.insert(key, nrows_to_keep);
            let shadow = state
                .chunk_metadata
                .get_mut(&key)
                .expect("shadow metadata just inserted");
            for chunk in &column_chunks {
                let buf = chunk.buffer()?.lock().expect("chunk buffer lock");
                shadow.insert(chunk.column().column_id, buf.encoder.metadata(buf.size()));
            }
            Ok(())
        })?;

        // Commit the rescanned statistics into shadow metadata; array
        // columns only carry their refreshed byte/element counts.
        for (chunk, stats) in column_chunks.iter().zip(column_stats.iter()) {
            let cd = chunk.column();
            if !cd.column_type.is_fixlen_array() {
                self.update_column_metadata(
                    catalog,
                    td,
                    cd.as_ref(),
                    fragment_id,
                    chunk,
                    stats,
                    &cd.column_type,
                    roll,
                )?;
            }
        }
        debug!(
            "compacted fragment: table={}, fragment_id={}, deleted_rows={}, surviving_rows={}",
            td.table_name, fragment_id, nrows_to_vacuum, nrows_to_keep
        );
        Ok(())
    }
}

fn validate_deleted_offsets(
    frag_offsets: &[u64],
    nrows_in_fragment: usize,
    td: &TableDescriptor,
    fragment_id: i32,
) -> Result<(), String> {
    let mut prev: Option<u64> = None;
    for &off in frag_offsets {
        if off as usize >= nrows_in_fragment {
            return Err(format!(
                "deleted offset out of range: table={}, fragment_id={}, offset={}, num_tuples={}",
                td.table_name, fragment_id, off, nrows_in_fragment
            ));
        }
        if let Some(prev) = prev {
            if off <= prev {
                return Err(format!(
                    "deleted offsets must be strictly increasing: table={}, fragment_id={}, offset={}, previous={}",
                    td.table_name, fragment_id, off, prev
                ));
            }
        }
        prev = Some(off);
    }
    Ok(())
}

/// Vacuum one chunk in place and return the statistics folded from its
/// surviving elements (empty for offset-indexed and array columns).
fn vacuum_one_chunk(
    chunk: &Chunk,
    frag_offsets: &[u64],
    nrows_in_fragment: usize,
    nrows_to_keep: usize,
) -> Result<ChunkUpdateStats, String> {
    let cd = chunk.column();
    let col_type = cd.column_type;
    if col_type.is_varlen_indeed() {
        let index_ref = chunk.index_buffer().ok_or_else(|| {
            format!(
                "varlen chunk is missing its index buffer: column={}",
                cd.column_name
            )
        })?;
        let data_ref = chunk.buffer()?;
        let mut data = data_ref.lock().expect("chunk buffer lock");
        let mut index = index_ref.lock().expect("chunk index buffer lock");
        if index.size() < (nrows_in_fragment + 1) * 4 {
            return Err(format!(
                "varlen offset array too small: column={}, index_bytes={}, num_tuples={}",
                cd.column_name,
                index.size(),
                nrows_in_fragment
            ));
        }
        let nbytes_var_kept =
            vacuum_varlen_rows(&mut data, &mut index, nrows_in_fragment, frag_offsets);
        data.encoder.set_num_elems(nrows_to_keep);
        data.set_size(nbytes_var_kept);
        data.set_updated();

        // Terminal sentinel, then the shrunken offset-array size.
        write_offset(index.mem_mut(), nrows_to_keep, nbytes_var_kept as i32);
        index.set_size(if nrows_to_keep == 0 { 0 } else { 4 * (nrows_to_keep + 1) });
        index.set_updated();
        return Ok(ChunkUpdateStats::new());
    }

    let element_size = if col_type.is_fixlen_array() {
        col_type.size.max(1) as usize
    } else {
        col_type.element_size().max(1)
    };
    let data_ref = chunk.buffer()?;
    let mut data = data_ref.lock().expect("chunk buffer lock");
    let nbytes_fix_kept =
        vacuum_fixlen_rows(&mut data, nrows_in_fragment, element_size, frag_offsets);
    data.encoder.set_num_elems(nrows_to_keep);
    data.set_size(nbytes_fix_kept);
    data.set_updated();

    // Fold every surviving element back into per-column statistics.
    let mut stats = ChunkUpdateStats::new();
    let can_be_null = !col_type.notnull;
    if col_type.is_fixlen_array() {
        let (mem, encoder) = data.mem_and_encoder_mut();
        for element in mem.chunks_exact(element_size) {
            encoder.update_array_metadata(element);
        }
    } else if col_type.is_fp() {
        for element in data.mem().chunks_exact(element_size) {
            let (v, is_null) = read_scalar_f64(element, &col_type);
            if is_null {
                stats.has_null = stats.has_null || can_be_null;
            } else {
                stats.fold_f64(v);
            }
        }
    } else {
        for element in data.mem().chunks_exact(element_size) {
            let (v, is_null) = read_scalar_i64(element, &col_type);
            if is_null {
                stats.has_null = stats.has_null || can_be_null;
            } else {
                stats.fold_i64(v);
            }
        }
    }
    Ok(stats)
}

/// Slide retained fixed-width element runs toward the front of the
/// buffer. Returns the surviving byte count.
fn vacuum_fixlen_rows(
    data: &mut ChunkBuffer,
    nrows_in_fragment: usize,
    element_size: usize,
    frag_offsets: &[u64],
) -> usize {
    let mem = data.mem_mut();
    let mut irow_of_blk_to_keep = 0usize;
    let mut irow_of_blk_to_fill = 0usize;
    let mut nbytes_fix_data_to_keep = 0usize;
    for irow in 0..=frag_offsets.len() {
        let irow_to_vacuum = if irow == frag_offsets.len() {
            nrows_in_fragment
        } else {
            frag_offsets[irow] as usize
        };
        if irow_to_vacuum > irow_of_blk_to_keep {
            let nrows_to_keep = irow_to_vacuum - irow_of_blk_to_keep;
            let nbytes_to_keep = nrows_to_keep * element_size;
            if irow_of_blk_to_fill != irow_of_blk_to_keep {
                let src = irow_of_blk_to_keep * element_size;
                mem.copy_within(src..src + nbytes_to_keep, irow_of_blk_to_fill * element_size);
            }
            irow_of_blk_to_fill += nrows_to_keep;
            nbytes_fix_data_to_keep += nbytes_to_keep;
        }
        irow_of_blk_to_keep = irow_to_vacuum + 1;
    }
    nbytes_fix_data_to_keep
}

fn read_offset(index_mem: &[u8], row: usize) -> usize {
    let at = row * 4;
    i32::from_le_bytes([
        index_mem[at],
        index_mem[at + 1],
        index_mem[at + 2],
        index_mem[at + 3],
    ]) as usize
}

fn write_offset(index_mem: &mut [u8], row: usize, offset: i32) {
    let at = row * 4;
    index_mem[at..at + 4].copy_from_slice(&offset.to_le_bytes());
}

/// Slide retained variable-length rows toward the front of the data
/// buffer, rebasing and compacting the offset array in the same walk.
/// Returns the surviving data byte count; the caller writes the terminal
/// sentinel and shrinks the buffers.
fn vacuum_varlen_rows(
    data: &mut ChunkBuffer,
    index: &mut ChunkBuffer,
    nrows_in_fragment: usize,
    frag_offsets: &[u64],
) -> usize {
    let data_size = data.size();
    let dmem = data.mem_mut();
    let imem = index.mem_mut();
    let mut irow_of_blk_to_keep = 0usize;
    let mut irow_of_blk_to_fill = 0usize;
    let mut nbytes_var_data_to_keep = 0usize;
    for irow in 0..=frag_offsets.len() {
        let is_last_one = irow == frag_offsets.len();
        let irow_to_vacuum = if is_last_one {
            nrows_in_fragment
        } else {
            frag_offsets[irow] as usize
        };
        if irow_to_vacuum > irow_of_blk_to_keep {
            let nrows_to_keep = irow_to_vacuum - irow_of_blk_to_keep;
            let ibyte_var_data_to_keep = nbytes_var_data_to_keep;
            let index_base = read_offset(imem, irow_of_blk_to_keep);
            let end_byte = if is_last_one {
                data_size
            } else {
                read_offset(imem, irow_to_vacuum)
            };
            let nbytes_to_keep = end_byte - index_base;
            if irow_of_blk_to_fill != irow_of_blk_to_keep {
                // Move the retained data run, then rebase its offsets.
                dmem.copy_within(index_base..index_base + nbytes_to_keep, ibyte_var_data_to_keep);
                for i in 0..nrows_to_keep {
                    let old = read_offset(imem, irow_of_blk_to_keep + i);
                    write_offset(
                        imem,
                        irow_of_blk_to_keep + i,
                        (ibyte_var_data_to_keep + (old - index_base)) as i32,
                    );
                }
            }
            nbytes_var_data_to_keep += nbytes_to_keep;

            // Compact the offset array with the same sliding cursors.
            if irow_of_blk_to_fill != irow_of_blk_to_keep {
                let src = irow_of_blk_to_keep * 4;
                imem.copy_within(src..src + nrows_to_keep * 4, irow_of_blk_to_fill * 4);
            }
            irow_of_blk_to_fill += nrows_to_keep;
        }
        irow_of_blk_to_keep = irow_to_vacuum + 1;
    }
    nbytes_var_data_to_keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamgr::buffer::{Encoder, StatsKind};

    fn fixed_buffer(values: &[i64]) -> ChunkBuffer {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        ChunkBuffer::new(bytes, Encoder::new(StatsKind::Int))
    }

    fn read_i64s(buf: &ChunkBuffer, n: usize) -> Vec<i64> {
        buf.mem()[..n * 8]
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().expect("8 bytes")))
            .collect()
    }

    #[test]
    fn fixlen_vacuum_slides_survivors_forward() {
        let mut buf = fixed_buffer(&[10, 20, 30, 40, 50]);
        let kept = vacuum_fixlen_rows(&mut buf, 5, 8, &[1, 3]);
        assert_eq!(kept, 24);
        assert_eq!(read_i64s(&buf, 3), vec![10, 30, 50]);
    }

    #[test]
    fn fixlen_vacuum_handles_leading_and_trailing_deletes() {
        let mut buf = fixed_buffer(&[10, 20, 30, 40]);
        let kept = vacuum_fixlen_rows(&mut buf, 4, 8, &[0, 3]);
        assert_eq!(kept, 16);
        assert_eq!(read_i64s(&buf, 2), vec![20, 30]);
    }

    #[test]
    fn fixlen_vacuum_of_adjacent_deletes() {
        let mut buf = fixed_buffer(&[1, 2, 3, 4, 5]);
        let kept = vacuum_fixlen_rows(&mut buf, 5, 8, &[1, 2, 3]);
        assert_eq!(kept, 16);
        assert_eq!(read_i64s(&buf, 2), vec![1, 5]);
    }

    fn varlen_buffers(data: &str, offsets: &[i32]) -> (ChunkBuffer, ChunkBuffer) {
        let data_buf = ChunkBuffer::new(data.as_bytes().to_vec(), Encoder::new(StatsKind::None));
        let mut index_bytes = Vec::with_capacity(offsets.len() * 4);
        for off in offsets {
            index_bytes.extend_from_slice(&off.to_le_bytes());
        }
        let index_buf = ChunkBuffer::new(index_bytes, Encoder::new(StatsKind::None));
        (data_buf, index_buf)
    }

    #[test]
    fn varlen_vacuum_rewrites_data_and_offsets() {
        let (mut data, mut index) = varlen_buffers("foobarbazqux", &[0, 3, 6, 9, 12]);
        let kept = vacuum_varlen_rows(&mut data, &mut index, 4, &[1, 3]);
        assert_eq!(kept, 6);
        assert_eq!(&data.mem()[..kept], b"foobaz");
        write_offset(index.mem_mut(), 2, kept as i32);
        assert_eq!(read_offset(index.mem(), 0), 0);
        assert_eq!(read_offset(index.mem(), 1), 3);
        assert_eq!(read_offset(index.mem(), 2), 6);
    }

    #[test]
    fn varlen_vacuum_with_unequal_lengths() {
        // rows: "a", "bbbb", "cc", "ddd"
        let (mut data, mut index) = varlen_buffers("abbbbccddd", &[0, 1, 5, 7, 10]);
        let kept = vacuum_varlen_rows(&mut data, &mut index, 4, &[0, 2]);
        assert_eq!(kept, 7);
        assert_eq!(&data.mem()[..kept], b"bbbbddd");
        write_offset(index.mem_mut(), 2, kept as i32);
        assert_eq!(read_offset(index.mem(), 0), 0);
        assert_eq!(read_offset(index.mem(), 1), 4);
        assert_eq!(read_offset(index.mem(), 2), 7);
    }

    #[test]
    fn varlen_vacuum_delete_all_rows() {
        let (mut data, mut index) = varlen_buffers("abc", &[0, 1, 2, 3]);
        let kept = vacuum_varlen_rows(&mut data, &mut index, 3, &[0, 1, 2]);
        assert_eq!(kept, 0);
    }
}
