//! Blocks flowing between stages

use crate::types::StageStats;
use arrow::array::Array;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

/// Immutable batch of rows
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    batch: RecordBatch,
}

impl DataBlock {
    /// Wrap a record batch
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Get the underlying batch
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Unwrap into the underlying batch
    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    /// Get the schema
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Number of rows
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Estimated in-memory size in bytes
    ///
    /// Counts only the rows in view, so a zero-copy slice is not charged
    /// for the buffers it shares with its parent batch.
    pub fn size_bytes(&self) -> usize {
        self.batch
            .columns()
            .iter()
            .map(|column| {
                column
                    .to_data()
                    .get_slice_memory_size()
                    .unwrap_or_else(|_| column.get_array_memory_size())
            })
            .sum()
    }
}

impl From<RecordBatch> for DataBlock {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

/// Terminal block: success or error, with optional statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EosBlock {
    /// Error message when the stage failed
    pub error: Option<String>,
    /// Execution statistics
    pub stats: Option<StageStats>,
}

impl EosBlock {
    /// Successful end of stream
    pub fn success() -> Self {
        Self::default()
    }

    /// Failed end of stream
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            stats: None,
        }
    }

    /// Attach statistics
    pub fn with_stats(mut self, stats: StageStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Whether this marks a failure
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Copy without statistics
    pub fn without_stats(&self) -> Self {
        Self {
            error: self.error.clone(),
            stats: None,
        }
    }
}

/// A data block or a terminal marker
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Data(DataBlock),
    Eos(EosBlock),
}

impl Block {
    /// Whether this is the terminal marker
    pub fn is_eos(&self) -> bool {
        matches!(self, Block::Eos(_))
    }

    /// Number of rows, zero for the terminal marker
    pub fn num_rows(&self) -> usize {
        match self {
            Block::Data(data) => data.num_rows(),
            Block::Eos(_) => 0,
        }
    }

    /// Get the data block, if this is one
    pub fn as_data(&self) -> Option<&DataBlock> {
        match self {
            Block::Data(data) => Some(data),
            Block::Eos(_) => None,
        }
    }
}

impl From<DataBlock> for Block {
    fn from(data: DataBlock) -> Self {
        Block::Data(data)
    }
}

impl From<EosBlock> for Block {
    fn from(eos: EosBlock) -> Self {
        Block::Eos(eos)
    }
}

impl From<RecordBatch> for Block {
    fn from(batch: RecordBatch) -> Self {
        Block::Data(DataBlock::new(batch))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    /// Two-column batch of ids and names
    pub fn create_test_batch(ids: Vec<i64>, names: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    /// Batch of `rows` sequential ids starting at `start`
    pub fn sequential_batch(start: i64, rows: usize) -> RecordBatch {
        let ids: Vec<i64> = (start..start + rows as i64).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("row-{}", i)).collect();
        create_test_batch(ids, names.iter().map(|s| s.as_str()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_test_batch;
    use super::*;

    #[test]
    fn test_data_block() {
        let block = DataBlock::new(create_test_batch(vec![1, 2, 3], vec!["a", "b", "c"]));
        assert_eq!(block.num_rows(), 3);
        assert_eq!(block.schema().fields().len(), 2);
        assert!(block.size_bytes() > 0);
    }

    #[test]
    fn test_slice_size_excludes_parent_rows() {
        let full = DataBlock::new(super::test_support::sequential_batch(0, 10_000));
        let slice = DataBlock::new(full.batch().slice(100, 10));
        assert!(slice.size_bytes() > 0);
        assert!(slice.size_bytes() * 100 < full.size_bytes());
    }

    #[test]
    fn test_eos_block() {
        let ok = EosBlock::success();
        assert!(!ok.is_error());

        let failed = EosBlock::error("boom").with_stats(StageStats::new(2));
        assert!(failed.is_error());
        assert!(failed.stats.is_some());
        assert_eq!(failed.without_stats(), EosBlock::error("boom"));
    }

    #[test]
    fn test_block_conversions() {
        let block: Block = create_test_batch(vec![1], vec!["a"]).into();
        assert!(!block.is_eos());
        assert_eq!(block.num_rows(), 1);

        let eos: Block = EosBlock::success().into();
        assert!(eos.is_eos());
        assert_eq!(eos.num_rows(), 0);
        assert!(eos.as_data().is_none());
    }
}
