//! Row and scalar value model for the operator core.
//!
//! The core is parameterized over "comparable, hashable, fixed-or-variable
//! length values"; this module pins down the concrete set. Floats are carried
//! by bit pattern so grouping and joining on them is total (NaN groups with
//! NaN) and rows round-trip through spill files unchanged.

use serde::{Deserialize, Serialize};

use riffle_common::{Result, RiffleError};

/// Scalar type of a key or payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 1-byte boolean slot.
    Boolean,
    /// 8-byte signed integer slot.
    Int64,
    /// 8-byte float slot, stored as its bit pattern.
    Float64,
    /// Variable-length UTF-8 string; a 16-byte header slot in packed layouts.
    Utf8,
}

impl DataType {
    /// Bytes the value occupies in a packed fixed-length key layout.
    /// Variable-length types reserve a `{offset, len}` header.
    pub fn slot_bytes(self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Utf8 => crate::layout::VAR_LEN_HEADER_BYTES,
        }
    }

    /// Whether the payload lives outside the packed fixed region.
    pub fn is_var_len(self) -> bool {
        matches!(self, DataType::Utf8)
    }
}

/// A single runtime value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Boolean value.
    Boolean(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float carried as its bit pattern.
    Float64Bits(u64),
    /// UTF-8 string.
    Utf8(String),
    /// SQL NULL.
    Null,
}

impl ScalarValue {
    /// Wrap an `f64` as its bit pattern.
    pub fn float64(v: f64) -> Self {
        Self::Float64Bits(v.to_bits())
    }

    /// Whether this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value as an `f64`, when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64Bits(v) => Some(f64::from_bits(*v)),
            _ => None,
        }
    }

    /// The type of a non-NULL value.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Int64(_) => Some(DataType::Int64),
            Self::Float64Bits(_) => Some(DataType::Float64),
            Self::Utf8(_) => Some(DataType::Utf8),
            Self::Null => None,
        }
    }

    /// Rough in-memory footprint, used for spool block accounting.
    pub fn estimate_bytes(&self) -> usize {
        match self {
            Self::Boolean(_) => 1,
            Self::Int64(_) | Self::Float64Bits(_) => 8,
            Self::Utf8(s) => s.len(),
            Self::Null => 0,
        }
    }
}

/// A materialized tuple row.
pub type TupleRow = Vec<ScalarValue>;

/// Rough in-memory footprint of a row, used for spool block accounting.
pub fn row_estimate_bytes(row: &TupleRow) -> usize {
    64 + row.iter().map(ScalarValue::estimate_bytes).sum::<usize>()
}

/// A row of `width` NULLs, for outer-join padding.
pub fn null_row(width: usize) -> TupleRow {
    vec![ScalarValue::Null; width]
}

fn type_mismatch(a: &ScalarValue, b: &ScalarValue) -> RiffleError {
    RiffleError::Execution(format!("cannot compare {a:?} with {b:?}"))
}

/// `a < b` for same-typed non-NULL values; floats use total order.
pub fn scalar_lt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    match (a, b) {
        (ScalarValue::Int64(x), ScalarValue::Int64(y)) => Ok(x < y),
        (ScalarValue::Float64Bits(x), ScalarValue::Float64Bits(y)) => {
            Ok(f64::from_bits(*x).total_cmp(&f64::from_bits(*y)).is_lt())
        }
        (ScalarValue::Utf8(x), ScalarValue::Utf8(y)) => Ok(x < y),
        (ScalarValue::Boolean(x), ScalarValue::Boolean(y)) => Ok(!x & y),
        _ => Err(type_mismatch(a, b)),
    }
}

/// `a > b` for same-typed non-NULL values; floats use total order.
pub fn scalar_gt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    scalar_lt(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_bits_group_nan() {
        let a = ScalarValue::float64(f64::NAN);
        let b = ScalarValue::float64(f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn scalar_compare_same_type() {
        assert!(scalar_lt(&ScalarValue::Int64(1), &ScalarValue::Int64(2)).unwrap());
        assert!(scalar_gt(
            &ScalarValue::Utf8("b".into()),
            &ScalarValue::Utf8("a".into())
        )
        .unwrap());
        assert!(scalar_lt(&ScalarValue::Int64(1), &ScalarValue::Utf8("x".into())).is_err());
    }

    #[test]
    fn slot_bytes_match_layout() {
        assert_eq!(DataType::Boolean.slot_bytes(), 1);
        assert_eq!(DataType::Int64.slot_bytes(), 8);
        assert!(DataType::Utf8.is_var_len());
    }
}
