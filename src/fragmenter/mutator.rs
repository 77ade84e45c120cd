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
//! Chunk mutator: typed element writes into raw column buffers.
//!
//! `write_element` is the per-element operation of the update path. It
//! dispatches on the RHS variant and the LHS physical type, honoring
//! decimal scaling, date-in-days storage and dictionary encoding, and
//! folds the written value into the worker's running statistics.
//!
//! Current limitations:
//! - Updates of none-encoded (offset-indexed) string columns are
//!   rejected; only dictionary-encoded string columns are updatable.
//! - Numeric-to-string casts are not supported at the storage layer.

use std::sync::Arc;

use crate::catalog::StringDictionary;
use crate::types::{
    ScalarValue, SqlTypeInfo, SECS_PER_DAY, convert_decimal_scale, decimal_to_double,
    null_sentinel_f32, null_sentinel_f64, null_sentinel_i64, pow10_i64, string_to_datum,
};

/// Raw view over one chunk buffer, shared by the scatter-write workers.
///
/// The driver derives it from the buffer while holding the buffer's lock
/// for the whole worker scope, and the offset partitioning guarantees
/// that concurrent workers touch disjoint elements.
#[derive(Copy, Clone)]
pub(crate) struct RawChunkSlice {
    base: *mut u8,
    len: usize,
}

// SAFETY: workers write disjoint byte ranges of a buffer whose lock the
// driver holds for the lifetime of the view.
unsafe impl Send for RawChunkSlice {}
unsafe impl Sync for RawChunkSlice {}

impl RawChunkSlice {
    pub(crate) fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn element_mut(&self, at: usize, len: usize) -> &mut [u8] {
        assert!(
            at + len <= self.len,
            "element write out of chunk bounds: at={}, len={}, buffer_len={}",
            at,
            len,
            self.len
        );
        // SAFETY: bounds checked above; disjointness across workers is the
        // partitioning contract.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(at), len) }
    }

    pub(crate) fn element(&self, at: usize, len: usize) -> &[u8] {
        assert!(
            at + len <= self.len,
            "element read out of chunk bounds: at={}, len={}, buffer_len={}",
            at,
            len,
            self.len
        );
        // SAFETY: bounds checked above.
        unsafe { std::slice::from_raw_parts(self.base.add(at), len) }
    }
}

/// Per-worker statistics accumulator, reduced into one chunk-level
/// summary after the join.
#[derive(Copy, Clone, Debug)]
pub struct ChunkUpdateStats {
    pub has_null: bool,
    pub min_i64: i64,
    pub max_i64: i64,
    pub min_f64: f64,
    pub max_f64: f64,
}

impl ChunkUpdateStats {
    pub fn new() -> Self {
        Self {
            has_null: false,
            min_i64: i64::MAX,
            max_i64: i64::MIN,
            min_f64: f64::MAX,
            max_f64: f64::MIN,
        }
    }

    pub fn fold_i64(&mut self, v: i64) {
        if self.min_i64 > v {
            self.min_i64 = v;
        }
        if self.max_i64 < v {
            self.max_i64 = v;
        }
    }

    pub fn fold_f64(&mut self, v: f64) {
        if self.min_f64 > v {
            self.min_f64 = v;
        }
        if self.max_f64 < v {
            self.max_f64 = v;
        }
    }

    pub fn merge(&mut self, other: &ChunkUpdateStats) {
        self.has_null = self.has_null || other.has_null;
        if other.has_i64() {
            self.fold_i64(other.min_i64);
            self.fold_i64(other.max_i64);
        }
        if other.has_f64() {
            self.fold_f64(other.min_f64);
            self.fold_f64(other.max_f64);
        }
    }

    pub fn has_i64(&self) -> bool {
        self.min_i64 <= self.max_i64
    }

    pub fn has_f64(&self) -> bool {
        self.min_f64 <= self.max_f64
    }
}

impl Default for ChunkUpdateStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-statement context the workers share while updating one column.
pub(crate) struct UpdateContext<'a> {
    pub lhs_type: SqlTypeInfo,
    pub rhs_type: SqlTypeInfo,
    pub column_name: &'a str,
    pub lhs_dict: Option<Arc<StringDictionary>>,
    pub rhs_dict: Option<Arc<StringDictionary>>,
}

fn decimal_overflow_msg(v: i64, rhs: &SqlTypeInfo, lhs: &SqlTypeInfo) -> String {
    format!(
        "Data conversion overflow on {} from DECIMAL({}, {}) to ({}, {})",
        v, rhs.dimension, rhs.scale, lhs.dimension, lhs.scale
    )
}

/// C's atof: a garbage literal reads as zero.
fn parse_numeric_literal(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

pub(crate) fn write_scalar_i64(bytes: &mut [u8], ty: &SqlTypeInfo, v: i64, col: &str) -> Result<(), String> {
    if ty.is_date_in_days() {
        let days = v / SECS_PER_DAY;
        if days < i32::MIN as i64 || days > i32::MAX as i64 {
            return Err(format!(
                "Integer conversion overflow on {} for column {}",
                v, col
            ));
        }
        bytes.copy_from_slice(&(days as i32).to_le_bytes());
        return Ok(());
    }
    match bytes.len() {
        1 => {
            if v < i8::MIN as i64 || v > i8::MAX as i64 {
                return Err(format!(
                    "Integer conversion overflow on {} for column {}",
                    v, col
                ));
            }
            bytes.copy_from_slice(&(v as i8).to_le_bytes());
        }
        2 => {
            if v < i16::MIN as i64 || v > i16::MAX as i64 {
                return Err(format!(
                    "Integer conversion overflow on {} for column {}",
                    v, col
                ));
            }
            bytes.copy_from_slice(&(v as i16).to_le_bytes());
        }
        4 => {
            if v < i32::MIN as i64 || v > i32::MAX as i64 {
                return Err(format!(
                    "Integer conversion overflow on {} for column {}",
                    v, col
                ));
            }
            bytes.copy_from_slice(&(v as i32).to_le_bytes());
        }
        8 => bytes.copy_from_slice(&v.to_le_bytes()),
        other => {
            return Err(format!(
                "unsupported element width for integer write: column={}, width={}",
                col, other
            ));
        }
    }
    Ok(())
}

pub(crate) fn write_scalar_f64(bytes: &mut [u8], ty: &SqlTypeInfo, v: f64, col: &str) -> Result<(), String> {
    if ty.is_fp() {
        match bytes.len() {
            4 => bytes.copy_from_slice(&(v as f32).to_le_bytes()),
            8 => bytes.copy_from_slice(&v.to_le_bytes()),
            other => {
                return Err(format!(
                    "unsupported element width for fp write: column={}, width={}",
                    col, other
                ));
            }
        }
        return Ok(());
    }
    if ty.is_decimal() {
        let scaled = v * pow10_i64(ty.scale) as f64;
        if !scaled.is_finite() || scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
            return Err(format!(
                "Integer conversion overflow on {} for column {}",
                v, col
            ));
        }
        return write_scalar_i64(bytes, ty, scaled as i64, col);
    }
    if !v.is_finite() || v >= i64::MAX as f64 || v <= i64::MIN as f64 {
        return Err(format!(
            "Integer conversion overflow on {} for column {}",
            v, col
        ));
    }
    write_scalar_i64(bytes, ty, v as i64, col)
}

pub(crate) fn write_null(bytes: &mut [u8], ty: &SqlTypeInfo, col: &str) -> Result<(), String> {
    if ty.notnull {
        return Err(format!("NULL value on NOT NULL column {}", col));
    }
    if ty.is_fp() {
        match bytes.len() {
            4 => bytes.copy_from_slice(&null_sentinel_f32().to_le_bytes()),
            8 => bytes.copy_from_slice(&null_sentinel_f64().to_le_bytes()),
            other => {
                return Err(format!(
                    "unsupported element width for fp null: column={}, width={}",
                    col, other
                ));
            }
        }
        return Ok(());
    }
    let sentinel = null_sentinel_i64(ty);
    match bytes.len() {
        1 => bytes.copy_from_slice(&(sentinel as i8).to_le_bytes()),
        2 => bytes.copy_from_slice(&(sentinel as i16).to_le_bytes()),
        4 => bytes.copy_from_slice(&(sentinel as i32).to_le_bytes()),
        8 => bytes.copy_from_slice(&sentinel.to_le_bytes()),
        other => {
            return Err(format!(
                "unsupported element width for null write: column={}, width={}",
                col, other
            ));
        }
    }
    Ok(())
}

/// Read one fixed-width element. Date-in-days values come back in the
/// seconds domain; the null flag reflects the type's sentinel.
pub(crate) fn read_scalar_i64(bytes: &[u8], ty: &SqlTypeInfo) -> (i64, bool) {
    let raw = match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        _ => i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]),
    };
    if raw == null_sentinel_i64(ty) {
        return (raw, true);
    }
    if ty.is_date_in_days() {
        return (raw * SECS_PER_DAY, false);
    }
    (raw, false)
}

pub(crate) fn read_scalar_f64(bytes: &[u8], _ty: &SqlTypeInfo) -> (f64, bool) {
    if bytes.len() == 4 {
        let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (v as f64, v == null_sentinel_f32())
    } else {
        let v = f64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        (v, v == null_sentinel_f64())
    }
}

/// Write one logical RHS value at `row_offset` of the chunk and fold it
/// into the worker's statistics.
pub(crate) fn write_element(
    view: RawChunkSlice,
    row_offset: u64,
    value: &ScalarValue,
    ctx: &UpdateContext<'_>,
    stats: &mut ChunkUpdateStats,
) -> Result<(), String> {
    let elem = ctx.lhs_type.element_size();
    let at = row_offset as usize * elem;

    // String-to-string assignments may arrive as an RHS dictionary code.
    // A resolvable RHS dictionary dereferences to the raw string; a
    // missing one means the planner passed a temporary literal index,
    // which this layer cannot resolve.
    let resolved;
    let value = if ctx.rhs_type.is_string() {
        if let ScalarValue::BigInt(code) = value {
            match &ctx.rhs_dict {
                Some(dict) => {
                    resolved = ScalarValue::NullableString(Some(dict.get_string(*code)?));
                    &resolved
                }
                None => {
                    return Err(
                        "UPDATE does not support cast from string literal to string column."
                            .to_string(),
                    );
                }
            }
        } else {
            value
        }
    } else {
        value
    };

    match value {
        ScalarValue::BigInt(v) => write_bigint(view, at, *v, ctx, stats),
        ScalarValue::Double(v) => write_fp(view, at, *v, ctx, stats),
        ScalarValue::Float(v) => write_fp(view, at, *v as f64, ctx, stats),
        ScalarValue::NullableString(Some(s)) if !s.is_empty() => {
            write_string(view, at, s, ctx, stats)
        }
        ScalarValue::NullableString(_) => {
            write_null(view.element_mut(at, elem), &ctx.lhs_type, ctx.column_name)?;
            stats.has_null = true;
            Ok(())
        }
    }
}

fn write_bigint(
    view: RawChunkSlice,
    at: usize,
    v: i64,
    ctx: &UpdateContext<'_>,
    stats: &mut ChunkUpdateStats,
) -> Result<(), String> {
    let lhs = &ctx.lhs_type;
    let rhs = &ctx.rhs_type;
    if lhs.is_string() {
        return Err("UPDATE does not support cast to string.".to_string());
    }
    let elem = lhs.element_size();
    if lhs.is_decimal() {
        let from_scale = if rhs.is_decimal() { rhs.scale } else { 0 };
        let scaled = convert_decimal_scale(v, from_scale, lhs.scale)
            .ok_or_else(|| decimal_overflow_msg(v, rhs, lhs))?;
        if scaled.unsigned_abs() >= pow10_i64(lhs.dimension) as u64 {
            return Err(decimal_overflow_msg(v, rhs, lhs));
        }
        write_scalar_i64(view.element_mut(at, elem), lhs, scaled, ctx.column_name)?;
        // A narrower storage width can silently truncate; a flipped sign
        // on the re-read value is the overflow tell.
        let (stored, _) = read_scalar_i64(view.element(at, elem), lhs);
        if (scaled >= 0) != (stored >= 0) {
            return Err(decimal_overflow_msg(v, rhs, lhs));
        }
        stats.fold_i64(stored);
        return Ok(());
    }
    if lhs.is_integral() {
        let v_int = if rhs.is_decimal() {
            decimal_to_double(rhs, v).round() as i64
        } else {
            v
        };
        write_scalar_i64(view.element_mut(at, elem), lhs, v_int, ctx.column_name)?;
        if lhs.is_date_in_days() {
            // Metadata stays in the seconds domain.
            let (seconds, _) = read_scalar_i64(view.element(at, elem), lhs);
            stats.fold_i64(seconds);
        } else {
            stats.fold_i64(v_int);
        }
        return Ok(());
    }
    // Floating LHS.
    let dv = if rhs.is_decimal() {
        decimal_to_double(rhs, v)
    } else {
        v as f64
    };
    write_scalar_f64(view.element_mut(at, elem), lhs, dv, ctx.column_name)?;
    stats.fold_f64(dv);
    Ok(())
}

fn write_fp(
    view: RawChunkSlice,
    at: usize,
    v: f64,
    ctx: &UpdateContext<'_>,
    stats: &mut ChunkUpdateStats,
) -> Result<(), String> {
    let lhs = &ctx.lhs_type;
    if lhs.is_string() {
        return Err("UPDATE does not support cast to string.".to_string());
    }
    let elem = lhs.element_size();
    write_scalar_f64(view.element_mut(at, elem), lhs, v, ctx.column_name)?;
    if lhs.is_integer() {
        stats.fold_i64(v as i64);
    } else {
        stats.fold_f64(v);
    }
    Ok(())
}

fn write_string(
    view: RawChunkSlice,
    at: usize,
    s: &str,
    ctx: &UpdateContext<'_>,
    stats: &mut ChunkUpdateStats,
) -> Result<(), String> {
    let lhs = &ctx.lhs_type;
    let elem = lhs.element_size();
    if lhs.is_string() {
        if !lhs.is_dict_string() {
            return Err(format!(
                "update of none-encoded string column {} is not supported",
                ctx.column_name
            ));
        }
        let dict = ctx.lhs_dict.as_ref().ok_or_else(|| {
            format!(
                "dictionary is not resolved for string column {}",
                ctx.column_name
            )
        })?;
        let code = dict.get_or_add(s);
        write_scalar_i64(view.element_mut(at, elem), lhs, code as i64, ctx.column_name)?;
        stats.fold_i64(code as i64);
        return Ok(());
    }

    let mut dval = parse_numeric_literal(s);
    if lhs.is_boolean() {
        dval = if matches!(s, "t" | "true" | "T" | "True") {
            1.0
        } else {
            0.0
        };
    } else if lhs.is_time() {
        dval = string_to_datum(s, lhs)? as f64;
    }
    if lhs.is_fp() || lhs.is_decimal() {
        write_scalar_f64(view.element_mut(at, elem), lhs, dval, ctx.column_name)?;
        stats.fold_f64(dval);
    } else {
        if lhs.is_date_in_days() {
            // Parsed day count; metadata is tracked in seconds.
            dval *= SECS_PER_DAY as f64;
        }
        let v = dval as i64;
        write_scalar_i64(view.element_mut(at, elem), lhs, v, ctx.column_name)?;
        stats.fold_i64(v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;

    fn view_of(buf: &mut Vec<u8>) -> RawChunkSlice {
        RawChunkSlice::new(buf.as_mut_ptr(), buf.len())
    }

    fn ctx_for<'a>(lhs: SqlTypeInfo, rhs: SqlTypeInfo) -> UpdateContext<'a> {
        UpdateContext {
            lhs_type: lhs,
            rhs_type: rhs,
            column_name: "c",
            lhs_dict: None,
            rhs_dict: None,
        }
    }

    #[test]
    fn bigint_write_reads_back() {
        let mut buf = vec![0u8; 16];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::scalar(SqlType::BigInt);
        let ctx = ctx_for(lhs, SqlTypeInfo::scalar(SqlType::BigInt));
        let mut stats = ChunkUpdateStats::new();
        write_element(view, 1, &ScalarValue::BigInt(-42), &ctx, &mut stats).expect("write");
        let (v, is_null) = read_scalar_i64(view.element(8, 8), &lhs);
        assert_eq!(v, -42);
        assert!(!is_null);
        assert_eq!((stats.min_i64, stats.max_i64), (-42, -42));
    }

    #[test]
    fn decimal_same_scale_stores_scaled_integer() {
        let mut buf = vec![0u8; 8];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::decimal(10, 2);
        let ctx = ctx_for(lhs, SqlTypeInfo::decimal(10, 2));
        let mut stats = ChunkUpdateStats::new();
        write_element(view, 0, &ScalarValue::BigInt(12345), &ctx, &mut stats).expect("write");
        let (v, _) = read_scalar_i64(view.element(0, 8), &lhs);
        assert_eq!(v, 12345);
    }

    #[test]
    fn decimal_overflow_names_both_precisions() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::decimal(5, 2);
        let ctx = ctx_for(lhs, SqlTypeInfo::decimal(10, 2));
        let mut stats = ChunkUpdateStats::new();
        let err = write_element(view, 0, &ScalarValue::BigInt(9_999_999), &ctx, &mut stats)
            .expect_err("overflow");
        assert_eq!(
            err,
            "Data conversion overflow on 9999999 from DECIMAL(10, 2) to (5, 2)"
        );
    }

    #[test]
    fn decimal_rescales_between_scales() {
        let mut buf = vec![0u8; 8];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::decimal(12, 4);
        let ctx = ctx_for(lhs, SqlTypeInfo::decimal(10, 2));
        let mut stats = ChunkUpdateStats::new();
        write_element(view, 0, &ScalarValue::BigInt(150), &ctx, &mut stats).expect("write");
        let (v, _) = read_scalar_i64(view.element(0, 8), &lhs);
        assert_eq!(v, 15_000);
    }

    #[test]
    fn empty_string_writes_null_sentinel() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::scalar(SqlType::Float);
        let ctx = ctx_for(lhs, SqlTypeInfo::varchar());
        let mut stats = ChunkUpdateStats::new();
        write_element(
            view,
            0,
            &ScalarValue::NullableString(Some(String::new())),
            &ctx,
            &mut stats,
        )
        .expect("write null");
        assert!(stats.has_null);
        let (_, is_null) = read_scalar_f64(view.element(0, 4), &lhs);
        assert!(is_null);
    }

    #[test]
    fn null_into_notnull_column_fails() {
        let mut buf = vec![0u8; 8];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::scalar(SqlType::BigInt).with_notnull();
        let ctx = ctx_for(lhs, SqlTypeInfo::varchar());
        let mut stats = ChunkUpdateStats::new();
        let err = write_element(view, 0, &ScalarValue::NullableString(None), &ctx, &mut stats)
            .expect_err("null into not null");
        assert!(err.contains("NOT NULL"), "err={err}");
    }

    #[test]
    fn string_literal_parses_into_float() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::scalar(SqlType::Float);
        let ctx = ctx_for(lhs, SqlTypeInfo::varchar());
        let mut stats = ChunkUpdateStats::new();
        write_element(
            view,
            0,
            &ScalarValue::NullableString(Some("4.5".to_string())),
            &ctx,
            &mut stats,
        )
        .expect("write");
        let (v, is_null) = read_scalar_f64(view.element(0, 4), &lhs);
        assert!(!is_null);
        assert_eq!(v, 4.5);
        assert_eq!((stats.min_f64, stats.max_f64), (4.5, 4.5));
    }

    #[test]
    fn boolean_literals_recognize_true_spellings() {
        let lhs = SqlTypeInfo::scalar(SqlType::Boolean);
        for (literal, expected) in [("t", 1), ("True", 1), ("false", 0), ("garbage", 0)] {
            let mut buf = vec![0u8; 1];
            let view = view_of(&mut buf);
            let ctx = ctx_for(lhs, SqlTypeInfo::varchar());
            let mut stats = ChunkUpdateStats::new();
            write_element(
                view,
                0,
                &ScalarValue::NullableString(Some(literal.to_string())),
                &ctx,
                &mut stats,
            )
            .expect("write bool");
            let (v, _) = read_scalar_i64(view.element(0, 1), &lhs);
            assert_eq!(v, expected, "literal={literal}");
        }
    }

    #[test]
    fn date_in_days_stores_days_tracks_seconds() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::date_in_days();
        let ctx = ctx_for(lhs, SqlTypeInfo::varchar());
        let mut stats = ChunkUpdateStats::new();
        write_element(
            view,
            0,
            &ScalarValue::NullableString(Some("1970-01-11".to_string())),
            &ctx,
            &mut stats,
        )
        .expect("write date");
        let days = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(days, 10);
        assert_eq!(stats.min_i64, 10 * SECS_PER_DAY);
    }

    #[test]
    fn string_literal_code_without_rhs_dict_fails() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::dict_string(1);
        let ctx = ctx_for(lhs, SqlTypeInfo::dict_string(0));
        let mut stats = ChunkUpdateStats::new();
        let err = write_element(view, 0, &ScalarValue::BigInt(7), &ctx, &mut stats)
            .expect_err("unresolvable literal index");
        assert!(err.contains("cast from string literal"), "err={err}");
    }

    #[test]
    fn double_into_integer_folds_int_stats() {
        let mut buf = vec![0u8; 4];
        let view = view_of(&mut buf);
        let lhs = SqlTypeInfo::scalar(SqlType::Int);
        let ctx = ctx_for(lhs, SqlTypeInfo::scalar(SqlType::Double));
        let mut stats = ChunkUpdateStats::new();
        write_element(view, 0, &ScalarValue::Double(7.9), &ctx, &mut stats).expect("write");
        let (v, _) = read_scalar_i64(view.element(0, 4), &lhs);
        assert_eq!(v, 7);
        assert!(stats.has_i64());
        assert!(!stats.has_f64());
    }
}
