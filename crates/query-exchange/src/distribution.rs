//! Distribution policies for routing blocks to mailboxes

use crate::block::DataBlock;
use crate::error::{ExchangeError, Result};
use arrow::array::*;
use arrow::datatypes::*;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

// FNV-1a, stable across processes so every sender agrees on the mapping
const FNV_SEED: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
const NULL_MARKER: u8 = 0xff;

/// How blocks are spread over the destination mailboxes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DistributionType {
    /// Exactly one destination receives everything
    Singleton,
    /// Every destination receives every block
    Broadcast,
    /// Rows go to the destination selected by hashing the key columns
    Hash {
        /// Columns forming the partition key
        key_columns: Vec<String>,
    },
    /// Each block goes to one uniformly random destination
    #[default]
    Random,
    /// Each block goes to the next destination in turn
    RoundRobin,
}

impl DistributionType {
    /// Create a hash distribution
    pub fn hash(key_columns: Vec<String>) -> Self {
        DistributionType::Hash { key_columns }
    }
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionType::Singleton => write!(f, "SINGLETON"),
            DistributionType::Broadcast => write!(f, "BROADCAST"),
            DistributionType::Hash { key_columns } => {
                write!(f, "HASH({})", key_columns.join(", "))
            }
            DistributionType::Random => write!(f, "RANDOM"),
            DistributionType::RoundRobin => write!(f, "ROUND_ROBIN"),
        }
    }
}

/// Routing decision for one block
#[derive(Debug)]
pub enum Route {
    /// Send to every destination
    All,
    /// Send to one destination
    One(usize),
    /// Send each piece to its destination, in destination order
    Partitioned(Vec<(usize, DataBlock)>),
}

/// Applies a [`DistributionType`] over a fixed number of destinations
#[derive(Debug)]
pub struct Distributor {
    kind: DistributionType,
    num_destinations: usize,
    rng: StdRng,
    next: usize,
}

impl Distributor {
    /// Create a distributor, validating the policy against the destination count
    pub fn new(kind: DistributionType, num_destinations: usize, seed: Option<u64>) -> Result<Self> {
        if num_destinations == 0 {
            return Err(ExchangeError::Config(
                "exchange needs at least one destination".to_string(),
            ));
        }
        match &kind {
            DistributionType::Singleton if num_destinations != 1 => {
                return Err(ExchangeError::Config(format!(
                    "SINGLETON distribution requires exactly one destination, got {}",
                    num_destinations
                )));
            }
            DistributionType::Hash { key_columns } if key_columns.is_empty() => {
                return Err(ExchangeError::Config(
                    "HASH distribution requires at least one key column".to_string(),
                ));
            }
            _ => {}
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            kind,
            num_destinations,
            rng,
            next: 0,
        })
    }

    /// Get the policy
    pub fn kind(&self) -> &DistributionType {
        &self.kind
    }

    /// Number of destinations
    pub fn num_destinations(&self) -> usize {
        self.num_destinations
    }

    /// Decide where `block` goes
    pub fn route(&mut self, block: &DataBlock) -> Result<Route> {
        match &self.kind {
            DistributionType::Singleton => Ok(Route::One(0)),
            DistributionType::Broadcast => Ok(Route::All),
            DistributionType::Random => Ok(Route::One(
                self.rng.gen_range(0..self.num_destinations),
            )),
            DistributionType::RoundRobin => {
                let idx = self.next;
                self.next = (self.next + 1) % self.num_destinations;
                Ok(Route::One(idx))
            }
            DistributionType::Hash { key_columns } => {
                partition_by_hash(block.batch(), key_columns, self.num_destinations)
                    .map(Route::Partitioned)
            }
        }
    }
}

/// Destination index of every row
pub fn hash_destinations(
    batch: &RecordBatch,
    key_columns: &[String],
    num_destinations: usize,
) -> Result<Vec<usize>> {
    let schema = batch.schema();
    let keys = key_columns
        .iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| {
                ExchangeError::Partition(format!("Key column '{}' not found", name))
            })
        })
        .map(|idx| idx.map(|i| batch.column(i)))
        .collect::<Result<Vec<_>>>()?;

    let mut hashes = vec![FNV_SEED; batch.num_rows()];
    for column in keys {
        hash_column(column.as_ref(), &mut hashes)?;
    }

    Ok(hashes
        .into_iter()
        .map(|h| (h % num_destinations as u64) as usize)
        .collect())
}

fn partition_by_hash(
    batch: &RecordBatch,
    key_columns: &[String],
    num_destinations: usize,
) -> Result<Vec<(usize, DataBlock)>> {
    let destinations = hash_destinations(batch, key_columns, num_destinations)?;

    let mut assignments: Vec<Vec<u32>> = vec![Vec::new(); num_destinations];
    for (row, dest) in destinations.into_iter().enumerate() {
        assignments[dest].push(row as u32);
    }

    let mut pieces = Vec::new();
    for (dest, rows) in assignments.into_iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        if rows.len() == batch.num_rows() {
            pieces.push((dest, DataBlock::new(batch.clone())));
            continue;
        }

        let indices = UInt32Array::from(rows);
        let columns: Vec<ArrayRef> = batch
            .columns()
            .iter()
            .map(|col| arrow::compute::take(col.as_ref(), &indices, None))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ExchangeError::Partition(e.to_string()))?;

        let piece = RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| ExchangeError::Partition(e.to_string()))?;
        pieces.push((dest, DataBlock::new(piece)));
    }
    Ok(pieces)
}

fn fnv_mix(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, b| (h ^ *b as u64).wrapping_mul(FNV_PRIME))
}

macro_rules! hash_values {
    ($column:expr, $hashes:expr, $ty:ty, |$v:ident| $bytes:expr) => {{
        let arr = $column.as_any().downcast_ref::<$ty>().ok_or_else(|| {
            ExchangeError::Partition(format!("unexpected array for {}", $column.data_type()))
        })?;
        for (row, hash) in $hashes.iter_mut().enumerate() {
            *hash = if arr.is_null(row) {
                fnv_mix(*hash, &[NULL_MARKER])
            } else {
                let $v = arr.value(row);
                fnv_mix(*hash, $bytes)
            };
        }
    }};
}

fn hash_primitive<T: ArrowPrimitiveType>(column: &dyn Array, hashes: &mut [u64]) -> Result<()> {
    hash_values!(column, hashes, PrimitiveArray<T>, |v| v.to_byte_slice());
    Ok(())
}

// SQL equality: -0.0 matches 0.0 and every NaN matches every other NaN
fn canonical_f64(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn hash_column(column: &dyn Array, hashes: &mut [u64]) -> Result<()> {
    match column.data_type() {
        DataType::Null => {
            for hash in hashes.iter_mut() {
                *hash = fnv_mix(*hash, &[NULL_MARKER]);
            }
        }
        DataType::Boolean => hash_values!(column, hashes, BooleanArray, |v| &[v as u8]),
        DataType::Int8 => hash_primitive::<Int8Type>(column, hashes)?,
        DataType::Int16 => hash_primitive::<Int16Type>(column, hashes)?,
        DataType::Int32 => hash_primitive::<Int32Type>(column, hashes)?,
        DataType::Int64 => hash_primitive::<Int64Type>(column, hashes)?,
        DataType::UInt8 => hash_primitive::<UInt8Type>(column, hashes)?,
        DataType::UInt16 => hash_primitive::<UInt16Type>(column, hashes)?,
        DataType::UInt32 => hash_primitive::<UInt32Type>(column, hashes)?,
        DataType::UInt64 => hash_primitive::<UInt64Type>(column, hashes)?,
        DataType::Float16 => {
            hash_values!(column, hashes, Float16Array, |v| &canonical_f64(v.to_f64()).to_le_bytes())
        }
        DataType::Float32 => {
            hash_values!(column, hashes, Float32Array, |v| &canonical_f64(v as f64).to_le_bytes())
        }
        DataType::Float64 => {
            hash_values!(column, hashes, Float64Array, |v| &canonical_f64(v).to_le_bytes())
        }
        DataType::Date32 => hash_primitive::<Date32Type>(column, hashes)?,
        DataType::Date64 => hash_primitive::<Date64Type>(column, hashes)?,
        DataType::Time32(TimeUnit::Second) => hash_primitive::<Time32SecondType>(column, hashes)?,
        DataType::Time32(TimeUnit::Millisecond) => {
            hash_primitive::<Time32MillisecondType>(column, hashes)?
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            hash_primitive::<Time64MicrosecondType>(column, hashes)?
        }
        DataType::Time64(TimeUnit::Nanosecond) => {
            hash_primitive::<Time64NanosecondType>(column, hashes)?
        }
        DataType::Timestamp(TimeUnit::Second, _) => {
            hash_primitive::<TimestampSecondType>(column, hashes)?
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            hash_primitive::<TimestampMillisecondType>(column, hashes)?
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            hash_primitive::<TimestampMicrosecondType>(column, hashes)?
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            hash_primitive::<TimestampNanosecondType>(column, hashes)?
        }
        DataType::Duration(TimeUnit::Second) => {
            hash_primitive::<DurationSecondType>(column, hashes)?
        }
        DataType::Duration(TimeUnit::Millisecond) => {
            hash_primitive::<DurationMillisecondType>(column, hashes)?
        }
        DataType::Duration(TimeUnit::Microsecond) => {
            hash_primitive::<DurationMicrosecondType>(column, hashes)?
        }
        DataType::Duration(TimeUnit::Nanosecond) => {
            hash_primitive::<DurationNanosecondType>(column, hashes)?
        }
        DataType::Interval(IntervalUnit::YearMonth) => {
            hash_primitive::<IntervalYearMonthType>(column, hashes)?
        }
        DataType::Interval(IntervalUnit::DayTime) => {
            hash_primitive::<IntervalDayTimeType>(column, hashes)?
        }
        DataType::Interval(IntervalUnit::MonthDayNano) => {
            hash_primitive::<IntervalMonthDayNanoType>(column, hashes)?
        }
        DataType::Decimal128(_, _) => hash_primitive::<Decimal128Type>(column, hashes)?,
        DataType::Decimal256(_, _) => hash_primitive::<Decimal256Type>(column, hashes)?,
        DataType::Utf8 => hash_values!(column, hashes, StringArray, |v| v.as_bytes()),
        DataType::LargeUtf8 => hash_values!(column, hashes, LargeStringArray, |v| v.as_bytes()),
        DataType::Utf8View => hash_values!(column, hashes, StringViewArray, |v| v.as_bytes()),
        DataType::Binary => hash_values!(column, hashes, BinaryArray, |v| v),
        DataType::LargeBinary => hash_values!(column, hashes, LargeBinaryArray, |v| v),
        DataType::BinaryView => hash_values!(column, hashes, BinaryViewArray, |v| v),
        DataType::FixedSizeBinary(_) => {
            hash_values!(column, hashes, FixedSizeBinaryArray, |v| v)
        }
        DataType::Dictionary(_, _) => {
            // Hash the decoded values so encoded and plain keys agree
            let dictionary = column.as_any_dictionary_opt().ok_or_else(|| {
                ExchangeError::Partition(format!("unexpected array for {}", column.data_type()))
            })?;
            let decoded = arrow::compute::take(dictionary.values().as_ref(), dictionary.keys(), None)
                .map_err(|e| ExchangeError::Partition(e.to_string()))?;
            hash_column(decoded.as_ref(), hashes)?;
        }
        other => {
            return Err(ExchangeError::Partition(format!(
                "Unsupported partition key type: {}",
                other
            )))
        }
    }
    Ok(())
}
