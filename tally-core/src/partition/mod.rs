//! Static partitioning of an index range across an ordered list of workers.
//!
//! The partitioner only looks at the length of the range and the number of
//! workers; the values of the range never influence chunk boundaries. Chunk
//! bounds are 1-based and inclusive, and index into a [`StepRange`] through
//! [`StepRange::nth`].
//!
//! ```
//! use tally::partition::{partition, Chunk};
//! use tally::worker::WorkerId;
//!
//! let workers = [WorkerId(2), WorkerId(3), WorkerId(4)];
//! let chunks = partition(10, &workers).unwrap();
//!
//! assert_eq!(
//!     chunks.iter().copied().collect::<Vec<_>>(),
//!     vec![
//!         Chunk { owner: WorkerId(2), lo: 1, hi: 4 },
//!         Chunk { owner: WorkerId(3), lo: 5, hi: 7 },
//!         Chunk { owner: WorkerId(4), lo: 8, hi: 10 },
//!     ]
//! );
//! ```
use std::{
    collections::HashSet,
    ops::{Range, RangeInclusive},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ParallelError, Result},
    worker::WorkerId,
};

/// A contiguous, non-empty run of indices `lo..=hi` owned by one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub owner: WorkerId,
    pub lo: usize,
    pub hi: usize,
}

impl Chunk {
    /// Number of indices in the chunk. Always at least one.
    pub fn size(&self) -> usize {
        self.hi - self.lo + 1
    }

    pub fn indices(&self) -> RangeInclusive<usize> {
        self.lo..=self.hi
    }
}

/// The chunks of a partitioned range, in worker-list order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    chunks: Vec<Chunk>,
}

impl Partition {
    /// The chunk owned by `worker`, if it received one.
    pub fn get(&self, worker: WorkerId) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.owner == worker)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Chunk> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of indices covered by all chunks.
    pub fn total(&self) -> usize {
        self.chunks.iter().map(Chunk::size).sum()
    }
}

impl IntoIterator for Partition {
    type Item = Chunk;
    type IntoIter = std::vec::IntoIter<Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

impl<'a> IntoIterator for &'a Partition {
    type Item = &'a Chunk;
    type IntoIter = std::slice::Iter<'a, Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

/// Split the index range `1..=len` into contiguous chunks, one per worker.
///
/// With `each = len / workers.len()` and `extra = len % workers.len()`:
/// - if `each == 0`, only the first `extra` workers receive a chunk, of size 1;
/// - otherwise every worker receives `each` indices and the first `extra`
///   workers one more.
///
/// Chunk sizes therefore differ by at most one, and an earlier worker never
/// receives fewer indices than a later one. A zero length yields an empty
/// partition.
///
/// # Errors
///
/// [`ParallelError::InvalidArgument`] if `len` is negative, `workers` is
/// empty, or `workers` names the same worker more than once.
pub fn partition(len: i64, workers: &[WorkerId]) -> Result<Partition> {
    let len = usize::try_from(len).map_err(|_| {
        ParallelError::InvalidArgument(format!("range length must be non-negative, got {len}"))
    })?;
    if workers.is_empty() {
        return Err(ParallelError::InvalidArgument(
            "cannot partition a range across an empty worker list".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(workers.len());
    if let Some(duplicate) = workers.iter().find(|worker| !seen.insert(**worker)) {
        return Err(ParallelError::InvalidArgument(format!(
            "{duplicate} appears more than once in the worker list"
        )));
    }

    let each = len / workers.len();
    let extra = len % workers.len();

    let chunks = if each == 0 {
        workers[..extra]
            .iter()
            .enumerate()
            .map(|(i, &owner)| Chunk {
                owner,
                lo: i + 1,
                hi: i + 1,
            })
            .collect()
    } else {
        let mut lo = 1;
        workers
            .iter()
            .enumerate()
            .map(|(i, &owner)| {
                let size = each + usize::from(i < extra);
                let chunk = Chunk {
                    owner,
                    lo,
                    hi: lo + size - 1,
                };
                lo += size;
                chunk
            })
            .collect()
    };

    Ok(Partition { chunks })
}

/// An arithmetic progression of loop indices.
///
/// The `k`-th element (1-based) is `start + (k - 1) * step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRange {
    start: i64,
    step: i64,
    len: usize,
}

impl StepRange {
    /// The progression `start, start + step, ...` up to and including `stop`
    /// when it is reached exactly, otherwise up to the last element before
    /// passing it.
    ///
    /// # Errors
    ///
    /// [`ParallelError::InvalidArgument`] if `step` is zero or the
    /// progression has more elements than fit in a `usize`.
    ///
    /// ```
    /// use tally::partition::StepRange;
    ///
    /// let range = StepRange::new(10, -3, 0).unwrap();
    /// assert_eq!(range.iter().collect::<Vec<_>>(), vec![10, 7, 4, 1]);
    /// ```
    pub fn new(start: i64, step: i64, stop: i64) -> Result<Self> {
        if step == 0 {
            return Err(ParallelError::InvalidArgument(
                "range step must be non-zero".to_string(),
            ));
        }
        let span = i128::from(stop) - i128::from(start);
        let len = if span != 0 && span.signum() != i128::from(step).signum() {
            0
        } else {
            usize::try_from(span / i128::from(step) + 1).map_err(|_| {
                ParallelError::InvalidArgument(format!(
                    "range {start}:{step}:{stop} has too many elements"
                ))
            })?
        };

        Ok(Self { start, step, len })
    }

    pub fn empty() -> Self {
        Self {
            start: 0,
            step: 1,
            len: 0,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `k`-th element, 1-based. `None` if `k` is zero or past the end.
    pub fn nth(&self, k: usize) -> Option<i64> {
        if k == 0 || k > self.len {
            return None;
        }
        let offset = i64::try_from(k - 1).ok()?.checked_mul(self.step)?;
        self.start.checked_add(offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (1..=self.len).filter_map(|k| self.nth(k))
    }
}

impl From<Range<i64>> for StepRange {
    fn from(range: Range<i64>) -> Self {
        let span = i128::from(range.end) - i128::from(range.start);
        Self {
            start: range.start,
            step: 1,
            len: usize::try_from(span.max(0)).unwrap_or(usize::MAX),
        }
    }
}

impl From<RangeInclusive<i64>> for StepRange {
    fn from(range: RangeInclusive<i64>) -> Self {
        let (start, end) = range.into_inner();
        let span = i128::from(end) - i128::from(start) + 1;
        Self {
            start,
            step: 1,
            len: usize::try_from(span.max(0)).unwrap_or(usize::MAX),
        }
    }
}
