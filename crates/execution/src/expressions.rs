//! Key and conjunct expression contracts.
//!
//! The full expression subsystem lives outside this crate; operators consume
//! it through [`ScalarExpr`] only. [`ColumnRef`] is the one implementation the
//! core itself needs (grouping keys, join keys, and slot references into
//! intermediate tuples are all column references).

use std::fmt;
use std::sync::Arc;

use riffle_common::{Result, RiffleError};

use crate::value::{DataType, ScalarValue};

/// A scalar expression evaluated against one tuple row.
pub trait ScalarExpr: fmt::Debug + Send + Sync {
    /// Static result type of the expression.
    fn data_type(&self) -> DataType;

    /// Evaluate against `row`; NULL is an ordinary result, not an error.
    fn eval(&self, row: &[ScalarValue]) -> Result<ScalarValue>;
}

/// Reference to a column of the input row.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    /// Zero-based column index.
    pub index: usize,
    /// Declared column type.
    pub data_type: DataType,
}

impl ScalarExpr for ColumnRef {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn eval(&self, row: &[ScalarValue]) -> Result<ScalarValue> {
        let value = row.get(self.index).ok_or_else(|| {
            RiffleError::Execution(format!(
                "column index {} out of bounds for row of width {}",
                self.index,
                row.len()
            ))
        })?;
        if let Some(dt) = value.data_type() {
            if dt != self.data_type {
                return Err(RiffleError::Execution(format!(
                    "column {} evaluated to {dt:?}, expected {:?}",
                    self.index, self.data_type
                )));
            }
        }
        Ok(value.clone())
    }
}

/// Shorthand constructor for a [`ColumnRef`].
pub fn col(index: usize, data_type: DataType) -> Arc<dyn ScalarExpr> {
    Arc::new(ColumnRef { index, data_type })
}

/// Evaluate boolean conjuncts against a row; NULL counts as false.
pub fn eval_conjuncts(conjuncts: &[Arc<dyn ScalarExpr>], row: &[ScalarValue]) -> Result<bool> {
    for conjunct in conjuncts {
        match conjunct.eval(row)? {
            ScalarValue::Boolean(true) => {}
            ScalarValue::Boolean(false) | ScalarValue::Null => return Ok(false),
            other => {
                return Err(RiffleError::Execution(format!(
                    "conjunct must evaluate to boolean, got {other:?}"
                )))
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_ref_evaluates_and_type_checks() {
        let expr = col(1, DataType::Int64);
        let row = vec![ScalarValue::Utf8("k".into()), ScalarValue::Int64(7)];
        assert_eq!(expr.eval(&row).unwrap(), ScalarValue::Int64(7));
        assert_eq!(expr.eval(&[ScalarValue::Null]).ok(), None);

        let bad = col(0, DataType::Int64);
        assert!(bad.eval(&row).is_err());
    }

    #[test]
    fn null_column_is_not_a_type_error() {
        let expr = col(0, DataType::Int64);
        assert_eq!(expr.eval(&[ScalarValue::Null]).unwrap(), ScalarValue::Null);
    }
}
