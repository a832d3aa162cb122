//! Child-operator contract.

use riffle_common::Result;

use crate::value::TupleRow;

/// A child operator the core pulls rows from.
///
/// `get_next` is the sole suspension point of the cooperative scheduling
/// model; it may block on IO inside the child. Implementations surface
/// deterministic failures as `RiffleError::Execution` so the core can
/// propagate them untouched.
pub trait RowSource: Send {
    /// Fill `batch` with up to `max_rows` rows. Returns `true` at end of
    /// stream; a source may return both rows and `true` on its final call.
    fn get_next(&mut self, max_rows: usize, batch: &mut Vec<TupleRow>) -> Result<bool>;
}

/// A [`RowSource`] over an in-memory row vector.
#[derive(Debug, Default)]
pub struct MemorySource {
    rows: Vec<TupleRow>,
    pos: usize,
}

impl MemorySource {
    /// Wrap a row vector.
    pub fn new(rows: Vec<TupleRow>) -> Self {
        Self { rows, pos: 0 }
    }
}

impl RowSource for MemorySource {
    fn get_next(&mut self, max_rows: usize, batch: &mut Vec<TupleRow>) -> Result<bool> {
        batch.clear();
        let end = (self.pos + max_rows.max(1)).min(self.rows.len());
        batch.extend(self.rows[self.pos..end].iter().cloned());
        self.pos = end;
        Ok(self.pos == self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    #[test]
    fn memory_source_batches_until_eos() {
        let rows: Vec<TupleRow> = (0..5).map(|i| vec![ScalarValue::Int64(i)]).collect();
        let mut src = MemorySource::new(rows);
        let mut batch = Vec::new();
        let mut total = 0;
        loop {
            let eos = src.get_next(2, &mut batch).unwrap();
            total += batch.len();
            if eos {
                break;
            }
        }
        assert_eq!(total, 5);
    }
}
