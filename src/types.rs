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
//! Logical and physical column types.
//!
//! `SqlTypeInfo` carries both the logical family and the physical storage
//! shape of a column: byte width, compression (dictionary codes,
//! date-in-days), decimal precision/scale and nullability. The update and
//! vacuum paths dispatch on it for element sizing, null sentinels and
//! min/max domains.
//!
//! Current limitations:
//! - Decimal storage widths are 2/4/8 bytes; there is no 128-bit decimal.
//! - Date-in-days columns are stored as 4-byte day counts.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

pub const SECS_PER_DAY: i64 = 86_400;

/// Days between 0001-01-01 (proleptic Gregorian) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SqlType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    Timestamp,
    IntervalDaySecond,
    Varchar,
    FixedLenArray,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Compression {
    None,
    Dict,
    DateInDays,
}

/// Physical + logical type of one column.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SqlTypeInfo {
    pub ty: SqlType,
    pub compression: Compression,
    /// Dictionary id for dict-encoded string columns. Zero on the physical
    /// columns of a sharded table; the logical table's descriptor is
    /// authoritative.
    pub comp_param: i32,
    /// Decimal precision.
    pub dimension: i32,
    /// Decimal scale.
    pub scale: i32,
    pub notnull: bool,
    /// Physical byte width of one element; negative for variable-length
    /// columns whose bytes live behind an offset array.
    pub size: i32,
}

impl SqlTypeInfo {
    pub fn scalar(ty: SqlType) -> Self {
        let size = match ty {
            SqlType::Boolean | SqlType::TinyInt => 1,
            SqlType::SmallInt => 2,
            SqlType::Int | SqlType::Float => 4,
            SqlType::BigInt
            | SqlType::Double
            | SqlType::Date
            | SqlType::Time
            | SqlType::Timestamp
            | SqlType::IntervalDaySecond => 8,
            SqlType::Decimal => 8,
            SqlType::Varchar | SqlType::FixedLenArray => -1,
        };
        Self {
            ty,
            compression: Compression::None,
            comp_param: 0,
            dimension: 0,
            scale: 0,
            notnull: false,
            size,
        }
    }

    /// `DECIMAL(dimension, scale)` stored as a scaled integer whose width
    /// follows the precision.
    pub fn decimal(dimension: i32, scale: i32) -> Self {
        let size = if dimension <= 4 {
            2
        } else if dimension <= 9 {
            4
        } else {
            8
        };
        Self {
            ty: SqlType::Decimal,
            compression: Compression::None,
            comp_param: 0,
            dimension,
            scale,
            notnull: false,
            size,
        }
    }

    /// Dictionary-encoded string column storing 32-bit codes.
    pub fn dict_string(dict_id: i32) -> Self {
        Self {
            ty: SqlType::Varchar,
            compression: Compression::Dict,
            comp_param: dict_id,
            dimension: 0,
            scale: 0,
            notnull: false,
            size: 4,
        }
    }

    /// Uncompressed string column: bytes behind an offset array.
    pub fn varchar() -> Self {
        Self::scalar(SqlType::Varchar)
    }

    /// Date stored as a 4-byte day count; chunk metadata stays in seconds.
    pub fn date_in_days() -> Self {
        Self {
            ty: SqlType::Date,
            compression: Compression::DateInDays,
            comp_param: 0,
            dimension: 0,
            scale: 0,
            notnull: false,
            size: 4,
        }
    }

    /// Fixed-length array column with a declared total byte size.
    pub fn fixlen_array(total_bytes: i32) -> Self {
        Self {
            ty: SqlType::FixedLenArray,
            compression: Compression::None,
            comp_param: 0,
            dimension: 0,
            scale: 0,
            notnull: false,
            size: total_bytes,
        }
    }

    pub fn with_notnull(mut self) -> Self {
        self.notnull = true;
        self
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.ty,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt
        )
    }

    pub fn is_boolean(&self) -> bool {
        self.ty == SqlType::Boolean
    }

    pub fn is_fp(&self) -> bool {
        matches!(self.ty, SqlType::Float | SqlType::Double)
    }

    pub fn is_decimal(&self) -> bool {
        self.ty == SqlType::Decimal
    }

    pub fn is_time(&self) -> bool {
        matches!(self.ty, SqlType::Date | SqlType::Time | SqlType::Timestamp)
    }

    pub fn is_time_interval(&self) -> bool {
        self.ty == SqlType::IntervalDaySecond
    }

    pub fn is_string(&self) -> bool {
        self.ty == SqlType::Varchar
    }

    pub fn is_dict_string(&self) -> bool {
        self.is_string() && self.compression == Compression::Dict
    }

    pub fn is_date_in_days(&self) -> bool {
        self.ty == SqlType::Date && self.compression == Compression::DateInDays
    }

    pub fn is_fixlen_array(&self) -> bool {
        self.ty == SqlType::FixedLenArray
    }

    /// Stored behind an offset array rather than as fixed-width elements.
    pub fn is_varlen_indeed(&self) -> bool {
        self.is_string() && self.compression != Compression::Dict
    }

    /// Integer-domain types whose chunk statistics live in i64.
    pub fn is_integral(&self) -> bool {
        self.is_integer() || self.is_boolean() || self.is_time() || self.is_time_interval()
    }

    /// Physical bytes of one element. Meaningless for variable-length
    /// columns.
    pub fn element_size(&self) -> usize {
        if self.is_dict_string() {
            return 4;
        }
        self.size.max(0) as usize
    }
}

/// The tagged RHS of one UPDATE assignment as handed down by the executor.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    BigInt(i64),
    Double(f64),
    Float(f32),
    NullableString(Option<String>),
}

/// Integer null sentinel for a fixed-width column, by physical width.
pub fn null_sentinel_i64(ty: &SqlTypeInfo) -> i64 {
    match ty.element_size() {
        1 => i8::MIN as i64,
        2 => i16::MIN as i64,
        4 => i32::MIN as i64,
        _ => i64::MIN,
    }
}

pub fn null_sentinel_f32() -> f32 {
    f32::MIN
}

pub fn null_sentinel_f64() -> f64 {
    f64::MIN
}

pub fn pow10_i64(exp: i32) -> i64 {
    10_i64.saturating_pow(exp.clamp(0, 18) as u32)
}

/// Rescale a decimal integer between scales. Overflow reports `None`.
pub fn convert_decimal_scale(value: i64, from_scale: i32, to_scale: i32) -> Option<i64> {
    if to_scale == from_scale {
        return Some(value);
    }
    if to_scale > from_scale {
        value.checked_mul(pow10_i64(to_scale - from_scale))
    } else {
        Some(value / pow10_i64(from_scale - to_scale))
    }
}

/// Decimal integer to its double value, `value / 10^scale`.
pub fn decimal_to_double(ty: &SqlTypeInfo, value: i64) -> f64 {
    value as f64 / pow10_i64(ty.scale) as f64
}

/// Parse a time-family literal into the column's integer datum: epoch
/// seconds for TIMESTAMP and plain DATE, day count for date-in-days,
/// seconds since midnight for TIME.
pub fn string_to_datum(s: &str, ty: &SqlTypeInfo) -> Result<i64, String> {
    match ty.ty {
        SqlType::Timestamp => {
            let parsed = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map_err(|e| format!("invalid TIMESTAMP literal '{}': {}", s, e))?;
            Ok(parsed.and_utc().timestamp())
        }
        SqlType::Date => {
            let parsed = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| format!("invalid DATE literal '{}': {}", s, e))?;
            let days = parsed.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE;
            if ty.is_date_in_days() {
                Ok(days)
            } else {
                Ok(days * SECS_PER_DAY)
            }
        }
        SqlType::Time => {
            let parsed = NaiveTime::parse_from_str(s, "%H:%M:%S")
                .map_err(|e| format!("invalid TIME literal '{}': {}", s, e))?;
            Ok(parsed.num_seconds_from_midnight() as i64)
        }
        _ => Err(format!(
            "string-to-datum is only defined for time types, got {:?}",
            ty.ty
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_width_follows_precision() {
        assert_eq!(SqlTypeInfo::decimal(4, 1).size, 2);
        assert_eq!(SqlTypeInfo::decimal(5, 2).size, 4);
        assert_eq!(SqlTypeInfo::decimal(10, 2).size, 8);
    }

    #[test]
    fn varlen_classification() {
        assert!(SqlTypeInfo::varchar().is_varlen_indeed());
        assert!(!SqlTypeInfo::dict_string(3).is_varlen_indeed());
        assert_eq!(SqlTypeInfo::dict_string(3).element_size(), 4);
    }

    #[test]
    fn integral_covers_time_and_boolean() {
        assert!(SqlTypeInfo::scalar(SqlType::Boolean).is_integral());
        assert!(SqlTypeInfo::scalar(SqlType::Timestamp).is_integral());
        assert!(SqlTypeInfo::scalar(SqlType::IntervalDaySecond).is_integral());
        assert!(!SqlTypeInfo::scalar(SqlType::Double).is_integral());
        assert!(!SqlTypeInfo::decimal(10, 2).is_integral());
    }

    #[test]
    fn datum_parse_date_in_days_returns_days() {
        let days = string_to_datum("1970-01-11", &SqlTypeInfo::date_in_days()).expect("parse date");
        assert_eq!(days, 10);
        let secs = string_to_datum("1970-01-11", &SqlTypeInfo::scalar(SqlType::Date))
            .expect("parse date");
        assert_eq!(secs, 10 * SECS_PER_DAY);
    }

    #[test]
    fn datum_parse_timestamp_and_time() {
        let ts = string_to_datum("1970-01-02 00:00:01", &SqlTypeInfo::scalar(SqlType::Timestamp))
            .expect("parse timestamp");
        assert_eq!(ts, SECS_PER_DAY + 1);
        let t = string_to_datum("01:02:03", &SqlTypeInfo::scalar(SqlType::Time))
            .expect("parse time");
        assert_eq!(t, 3723);
    }

    #[test]
    fn decimal_rescale_and_overflow() {
        assert_eq!(convert_decimal_scale(150, 2, 2), Some(150));
        assert_eq!(convert_decimal_scale(150, 2, 4), Some(15_000));
        assert_eq!(convert_decimal_scale(15_999, 4, 2), Some(159));
        assert_eq!(convert_decimal_scale(i64::MAX, 0, 2), None);
    }

    #[test]
    fn null_sentinels_follow_width() {
        assert_eq!(
            null_sentinel_i64(&SqlTypeInfo::scalar(SqlType::Boolean)),
            i8::MIN as i64
        );
        assert_eq!(
            null_sentinel_i64(&SqlTypeInfo::decimal(5, 2)),
            i32::MIN as i64
        );
        assert_eq!(
            null_sentinel_i64(&SqlTypeInfo::scalar(SqlType::BigInt)),
            i64::MIN
        );
        assert_eq!(
            null_sentinel_i64(&SqlTypeInfo::dict_string(1)),
            i32::MIN as i64
        );
    }
}
