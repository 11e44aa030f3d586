//! Result types: rows, result sets, execution outcomes, and batch slices.

use std::collections::VecDeque;
use std::ops::Range;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tds_rpc::ParamValue;

use crate::error::{Error, ServerMessage};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
}

impl Column {
    /// Create a column.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One row of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<ParamValue>,
}

impl Row {
    /// Create a row from its values.
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self { values }
    }

    /// Value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    /// Integer value at `index`.
    #[must_use]
    pub fn get_i64(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(ParamValue::as_i64)
    }

    /// String value at `index`.
    #[must_use]
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(ParamValue::as_str)
    }

    /// Binary value at `index`.
    #[must_use]
    pub fn get_bytes(&self, index: usize) -> Option<&[u8]> {
        match self.get(index) {
            Some(ParamValue::Binary(b)) => Some(b),
            _ => None,
        }
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A complete result set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    /// Columns.
    pub columns: Vec<Column>,
    /// Rows.
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Create a result set with the named columns and no rows.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Column::new).collect(),
            rows: Vec::new(),
        }
    }

    /// Builder-style row append.
    #[must_use]
    pub fn with_row(mut self, values: Vec<ParamValue>) -> Self {
        self.rows.push(Row::new(values));
        self
    }
}

/// An output parameter written back after execution.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParam {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: ParamValue,
}

/// Result of a non-query execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecuteResult {
    /// Rows affected, `-1` when the server reported no count.
    pub rows_affected: i64,
    /// Output parameters and return values.
    pub output_params: Vec<OutputParam>,
    /// Procedure return status.
    pub return_status: Option<i32>,
    /// Informational messages.
    pub warnings: Vec<ServerMessage>,
}

impl ExecuteResult {
    /// Get an output parameter by name.
    #[must_use]
    pub fn get_output(&self, name: &str) -> Option<&OutputParam> {
        let name = name.trim_start_matches('@');
        self.output_params
            .iter()
            .find(|p| p.name.trim_start_matches('@').eq_ignore_ascii_case(name))
    }
}

/// Buffered rows of one or more result sets.
///
/// Yields the rows of the current result set; [`next_result`](Self::next_result)
/// moves to the following one.
#[derive(Debug, Default)]
pub struct RowStream {
    current: Option<ResultSet>,
    rows: VecDeque<Row>,
    pending: VecDeque<ResultSet>,
    result: ExecuteResult,
}

impl RowStream {
    pub(crate) fn new(result_sets: Vec<ResultSet>, result: ExecuteResult) -> Self {
        let mut pending: VecDeque<ResultSet> = result_sets.into();
        let mut stream = Self {
            current: None,
            rows: VecDeque::new(),
            pending: VecDeque::new(),
            result,
        };
        if let Some(first) = pending.pop_front() {
            stream.load(first);
        }
        stream.pending = pending;
        stream
    }

    fn load(&mut self, mut set: ResultSet) {
        self.rows = std::mem::take(&mut set.rows).into();
        self.current = Some(set);
    }

    /// Columns of the current result set.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        self.current.as_ref().map_or(&[], |s| &s.columns)
    }

    /// Move to the next result set. Returns `false` when there is none.
    pub fn next_result(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(set) => {
                self.load(set);
                true
            }
            None => {
                self.current = None;
                self.rows.clear();
                false
            }
        }
    }

    /// Next row of the current result set.
    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Rows affected and outputs of the execution.
    #[must_use]
    pub fn execute_result(&self) -> &ExecuteResult {
        &self.result
    }

    /// Collect the rest of the current result set.
    pub fn collect_rows(&mut self) -> Vec<Row> {
        self.rows.drain(..).collect()
    }
}

impl Stream for RowStream {
    type Item = Result<Row, Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().next_row().map(Ok))
    }
}

/// Outcome of one item in an executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemResult {
    /// Rows affected by this item alone, `-1` without a count.
    pub records_affected: i64,
    /// Rows affected by this and every earlier item, `-1` without a count.
    pub cumulative_records_affected: i64,
    /// This item's slice of the batch's errors.
    pub errors: Range<usize>,
    /// This item's slice of the batch's warnings.
    pub warnings: Range<usize>,
}

/// Per-item results of an executed batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResults {
    items: Vec<BatchItemResult>,
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
}

impl BatchResults {
    pub(crate) fn new(
        items: Vec<BatchItemResult>,
        errors: Vec<ServerMessage>,
        warnings: Vec<ServerMessage>,
    ) -> Self {
        Self {
            items,
            errors,
            warnings,
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Result of item `index`.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<&BatchItemResult> {
        self.items.get(index)
    }

    /// Rows affected by item `index` alone.
    #[must_use]
    pub fn records_affected(&self, index: usize) -> Option<i64> {
        self.items.get(index).map(|i| i.records_affected)
    }

    /// Rows affected across the whole batch, `-1` without any count.
    #[must_use]
    pub fn total_records_affected(&self) -> i64 {
        self.items
            .iter()
            .rev()
            .map(|i| i.cumulative_records_affected)
            .find(|c| *c >= 0)
            .unwrap_or(-1)
    }

    /// Errors raised by item `index`.
    #[must_use]
    pub fn errors(&self, index: usize) -> &[ServerMessage] {
        self.items
            .get(index)
            .and_then(|i| self.errors.get(i.errors.clone()))
            .unwrap_or(&[])
    }

    /// Warnings raised by item `index`.
    #[must_use]
    pub fn warnings(&self, index: usize) -> &[ServerMessage] {
        self.items
            .get(index)
            .and_then(|i| self.warnings.get(i.warnings.clone()))
            .unwrap_or(&[])
    }

    /// Every error in the batch.
    #[must_use]
    pub fn all_errors(&self) -> &[ServerMessage] {
        &self.errors
    }

    /// Whether any item failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_row_stream_walks_result_sets() {
        let first = ResultSet::new(["id"])
            .with_row(vec![ParamValue::Int(1)])
            .with_row(vec![ParamValue::Int(2)]);
        let second = ResultSet::new(["name"]).with_row(vec![ParamValue::from("x")]);
        let mut stream = RowStream::new(vec![first, second], ExecuteResult::default());

        assert_eq!(stream.columns()[0].name, "id");
        assert_eq!(stream.next_row().unwrap().get_i64(0), Some(1));
        assert_eq!(stream.collect_rows().len(), 1);
        assert!(stream.next_row().is_none());

        assert!(stream.next_result());
        assert_eq!(stream.next_row().unwrap().get_str(0), Some("x"));
        assert!(!stream.next_result());
        assert!(stream.columns().is_empty());
    }

    #[test]
    fn test_get_output_ignores_prefix_and_case() {
        let result = ExecuteResult {
            output_params: vec![OutputParam {
                name: "@Total".into(),
                value: ParamValue::Int(5),
            }],
            ..ExecuteResult::default()
        };
        assert!(result.get_output("total").is_some());
        assert!(result.get_output("@TOTAL").is_some());
        assert!(result.get_output("other").is_none());
    }

    #[test]
    fn test_batch_results_slices() {
        let errors = vec![ServerMessage::new(547, 16, "fk")];
        let items = vec![
            BatchItemResult {
                records_affected: 2,
                cumulative_records_affected: 2,
                errors: 0..0,
                warnings: 0..0,
            },
            BatchItemResult {
                records_affected: -1,
                cumulative_records_affected: -1,
                errors: 0..1,
                warnings: 0..0,
            },
        ];
        let results = BatchResults::new(items, errors, Vec::new());
        assert!(results.errors(0).is_empty());
        assert_eq!(results.errors(1)[0].number, 547);
        assert!(results.errors(5).is_empty());
        assert_eq!(results.total_records_affected(), 2);
        assert!(results.has_errors());
    }
}
