//! Shared traversal machinery for the routing algorithms
//!
//! Explicit, owned containers stand in for recursion and language-level
//! heaps: a binary min-heap of pixel records for elevation-ordered
//! expansion, and a vector of flow-walk frames for preemptable upstream
//! walks. Depths scale with raster size, so none of the traversals
//! recurse.

use std::cmp::Ordering;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use terraflow_core::Result;
use tracing::info;

/// A pixel in an elevation-ordered priority queue.
///
/// Ordered by value ascending, ties broken by `tiebreak` ascending. The
/// tiebreak is the pixel's block index, which keeps popped pixels spatially
/// clustered and makes heap order independent of allocator behavior.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PixelRecord {
    pub value: f64,
    pub x: i64,
    pub y: i64,
    pub tiebreak: usize,
}

impl PartialEq for PixelRecord {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.tiebreak == other.tiebreak
    }
}

impl Eq for PixelRecord {}

impl PartialOrd for PixelRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed ordering so BinaryHeap (a max-heap) pops the lowest value first
impl Ord for PixelRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .partial_cmp(&self.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
    }
}

/// One suspended step of an upstream or downstream flow walk.
///
/// `next_neighbor` records how many of the 8 neighbors have been consumed,
/// so a preempted frame resumes without recomputation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowFrame {
    pub x: i64,
    pub y: i64,
    pub next_neighbor: usize,
    pub running: f64,
}

impl FlowFrame {
    pub fn new(x: i64, y: i64, running: f64) -> Self {
        Self {
            x,
            y,
            next_neighbor: 0,
            running,
        }
    }
}

/// Time-throttled progress reporting for the outer tile-scan loops.
pub(crate) struct ProgressLog {
    last: Instant,
    interval: Duration,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            interval: Duration::from_secs(5),
        }
    }

    /// Emit `message()` if enough time has passed since the last report.
    pub fn tick(&mut self, message: impl FnOnce() -> String) {
        if self.last.elapsed() >= self.interval {
            info!("{}", message());
            self.last = Instant::now();
        }
    }
}

/// Create the per-invocation scratch directory, under `working_dir` when
/// given, else under the system temp directory. Dropped (and removed) on
/// success.
pub(crate) fn scratch_dir(working_dir: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match working_dir {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_pixel_record_heap_pops_lowest_value_first() {
        let mut heap = BinaryHeap::new();
        heap.push(PixelRecord {
            value: 5.0,
            x: 0,
            y: 0,
            tiebreak: 0,
        });
        heap.push(PixelRecord {
            value: 1.0,
            x: 1,
            y: 0,
            tiebreak: 3,
        });
        heap.push(PixelRecord {
            value: 3.0,
            x: 2,
            y: 0,
            tiebreak: 1,
        });
        let order: Vec<f64> = std::iter::from_fn(|| heap.pop().map(|r| r.value)).collect();
        assert_eq!(order, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_pixel_record_ties_break_on_block_index() {
        let mut heap = BinaryHeap::new();
        for tiebreak in [7usize, 2, 9, 4] {
            heap.push(PixelRecord {
                value: 2.0,
                x: tiebreak as i64,
                y: 0,
                tiebreak,
            });
        }
        let order: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|r| r.tiebreak)).collect();
        assert_eq!(order, vec![2, 4, 7, 9]);
    }
}
