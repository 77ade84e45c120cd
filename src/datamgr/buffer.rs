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
//! Chunk buffers and their per-chunk statistics encoder.
//!
//! A `ChunkBuffer` owns the raw bytes of one column chunk plus the
//! `Encoder` that tracks the chunk-level zone map (min, max, has-null,
//! element count). The buffer's logical size may shrink below its
//! allocation after a vacuum; the allocation itself is never moved while
//! the buffer is shared.

use std::sync::{Arc, Mutex};

use crate::types::SqlTypeInfo;

/// Which domain the encoder tracks min/max in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatsKind {
    Int,
    Fp,
    None,
}

/// Statistics domain for a column type: integer-domain stats for
/// integral/decimal/dict-string columns, floating stats for fp columns,
/// none for arrays and offset-indexed strings.
pub fn stats_kind_for(ty: &SqlTypeInfo) -> StatsKind {
    if ty.is_fp() {
        return StatsKind::Fp;
    }
    if ty.is_fixlen_array() || ty.is_varlen_indeed() {
        return StatsKind::None;
    }
    StatsKind::Int
}

/// Encoded chunk-level statistics as published into the fragment's
/// metadata map.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkStatsValue {
    Int { min: i64, max: i64 },
    Fp { min: f64, max: f64 },
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkMetadata {
    pub num_bytes: usize,
    pub num_elements: usize,
    pub has_null: bool,
    pub stats: ChunkStatsValue,
}

impl ChunkMetadata {
    pub fn empty() -> Self {
        Self {
            num_bytes: 0,
            num_elements: 0,
            has_null: false,
            stats: ChunkStatsValue::None,
        }
    }
}

/// Per-chunk running statistics accumulator and metadata emitter.
///
/// `update_stats_*` only widens the tracked range; the insert path seeds
/// it and the update/vacuum paths fold newly written or surviving values
/// into it.
#[derive(Clone, Debug)]
pub struct Encoder {
    kind: StatsKind,
    num_elems: usize,
    has_null: bool,
    min_i64: i64,
    max_i64: i64,
    min_f64: f64,
    max_f64: f64,
}

impl Encoder {
    pub fn new(kind: StatsKind) -> Self {
        Self {
            kind,
            num_elems: 0,
            has_null: false,
            min_i64: i64::MAX,
            max_i64: i64::MIN,
            min_f64: f64::MAX,
            max_f64: f64::MIN,
        }
    }

    pub fn from_metadata(kind: StatsKind, meta: &ChunkMetadata) -> Self {
        let mut encoder = Self::new(kind);
        encoder.num_elems = meta.num_elements;
        encoder.has_null = meta.has_null;
        match meta.stats {
            ChunkStatsValue::Int { min, max } => {
                encoder.min_i64 = min;
                encoder.max_i64 = max;
            }
            ChunkStatsValue::Fp { min, max } => {
                encoder.min_f64 = min;
                encoder.max_f64 = max;
            }
            ChunkStatsValue::None => {}
        }
        encoder
    }

    pub fn stats_kind(&self) -> StatsKind {
        self.kind
    }

    pub fn num_elems(&self) -> usize {
        self.num_elems
    }

    pub fn set_num_elems(&mut self, n: usize) {
        self.num_elems = n;
    }

    pub fn has_null(&self) -> bool {
        self.has_null
    }

    pub fn update_has_null(&mut self, has_null: bool) {
        self.has_null = self.has_null || has_null;
    }

    pub fn update_stats_i64(&mut self, v: i64, has_null: bool) {
        self.update_has_null(has_null);
        if self.min_i64 > v {
            self.min_i64 = v;
        }
        if self.max_i64 < v {
            self.max_i64 = v;
        }
    }

    pub fn update_stats_f64(&mut self, v: f64, has_null: bool) {
        self.update_has_null(has_null);
        if self.min_f64 > v {
            self.min_f64 = v;
        }
        if self.max_f64 < v {
            self.max_f64 = v;
        }
    }

    /// Refresh nullability from one surviving fixed-length array element.
    /// A null array is marked by the i32 null sentinel in its leading
    /// word.
    pub fn update_array_metadata(&mut self, elem: &[u8]) {
        if elem.len() >= 4 {
            let lead = i32::from_le_bytes([elem[0], elem[1], elem[2], elem[3]]);
            if lead == i32::MIN {
                self.has_null = true;
            }
        }
    }

    /// Serialize the running statistics into a metadata slot.
    pub fn metadata(&self, num_bytes: usize) -> ChunkMetadata {
        let stats = match self.kind {
            StatsKind::Int if self.min_i64 <= self.max_i64 => ChunkStatsValue::Int {
                min: self.min_i64,
                max: self.max_i64,
            },
            StatsKind::Fp if self.min_f64 <= self.max_f64 => ChunkStatsValue::Fp {
                min: self.min_f64,
                max: self.max_f64,
            },
            _ => ChunkStatsValue::None,
        };
        ChunkMetadata {
            num_bytes,
            num_elements: self.num_elems,
            has_null: self.has_null,
            stats,
        }
    }
}

/// Raw bytes of one column chunk at CPU level.
#[derive(Debug)]
pub struct ChunkBuffer {
    mem: Vec<u8>,
    size: usize,
    updated: bool,
    pub encoder: Encoder,
}

pub type BufferRef = Arc<Mutex<ChunkBuffer>>;

impl ChunkBuffer {
    pub fn new(mem: Vec<u8>, encoder: Encoder) -> Self {
        let size = mem.len();
        Self {
            mem,
            size,
            updated: false,
            encoder,
        }
    }

    pub fn into_ref(self) -> BufferRef {
        Arc::new(Mutex::new(self))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Shrink or restore the logical byte size. The allocation is kept;
    /// vacuum only ever moves retained bytes toward the front.
    pub fn set_size(&mut self, size: usize) {
        assert!(
            size <= self.mem.len(),
            "buffer logical size {} exceeds allocation {}",
            size,
            self.mem.len()
        );
        self.size = size;
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn set_updated(&mut self) {
        self.updated = true;
    }

    pub fn clear_updated(&mut self) {
        self.updated = false;
    }

    pub fn mem(&self) -> &[u8] {
        &self.mem[..self.size]
    }

    pub fn mem_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.mem[..size]
    }

    /// Split borrow for callers that scan the bytes while refreshing the
    /// encoder.
    pub fn mem_and_encoder_mut(&mut self) -> (&[u8], &mut Encoder) {
        (&self.mem[..self.size], &mut self.encoder)
    }

    /// Base pointer and logical length for the parallel scatter writers.
    /// The caller must keep the buffer locked for as long as the pointer
    /// is live.
    pub(crate) fn raw_parts_mut(&mut self) -> (*mut u8, usize) {
        (self.mem.as_mut_ptr(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SqlType, SqlTypeInfo};

    #[test]
    fn stats_kind_per_type() {
        assert_eq!(
            stats_kind_for(&SqlTypeInfo::scalar(SqlType::BigInt)),
            StatsKind::Int
        );
        assert_eq!(stats_kind_for(&SqlTypeInfo::decimal(10, 2)), StatsKind::Int);
        assert_eq!(stats_kind_for(&SqlTypeInfo::dict_string(1)), StatsKind::Int);
        assert_eq!(
            stats_kind_for(&SqlTypeInfo::scalar(SqlType::Double)),
            StatsKind::Fp
        );
        assert_eq!(stats_kind_for(&SqlTypeInfo::varchar()), StatsKind::None);
        assert_eq!(stats_kind_for(&SqlTypeInfo::fixlen_array(24)), StatsKind::None);
    }

    #[test]
    fn encoder_widens_and_emits() {
        let mut encoder = Encoder::new(StatsKind::Int);
        encoder.set_num_elems(3);
        encoder.update_stats_i64(10, false);
        encoder.update_stats_i64(-4, true);
        let meta = encoder.metadata(24);
        assert_eq!(meta.num_bytes, 24);
        assert_eq!(meta.num_elements, 3);
        assert!(meta.has_null);
        assert_eq!(meta.stats, ChunkStatsValue::Int { min: -4, max: 10 });
    }

    #[test]
    fn encoder_without_values_emits_no_range() {
        let encoder = Encoder::new(StatsKind::Int);
        assert_eq!(encoder.metadata(0).stats, ChunkStatsValue::None);
    }

    #[test]
    fn encoder_reseeds_from_metadata() {
        let mut encoder = Encoder::new(StatsKind::Fp);
        encoder.set_num_elems(2);
        encoder.update_stats_f64(1.5, false);
        encoder.update_stats_f64(2.5, false);
        let meta = encoder.metadata(16);
        let reseeded = Encoder::from_metadata(StatsKind::Fp, &meta);
        assert_eq!(reseeded.metadata(16), meta);
    }

    #[test]
    fn buffer_size_shrinks_but_keeps_allocation() {
        let mut buf = ChunkBuffer::new(vec![1, 2, 3, 4], Encoder::new(StatsKind::Int));
        assert_eq!(buf.size(), 4);
        buf.set_size(2);
        assert_eq!(buf.mem(), &[1, 2]);
        buf.set_size(4);
        assert_eq!(buf.mem(), &[1, 2, 3, 4]);
    }
}
