//! Contiguous, disjoint slicing of the ordered work list across workers.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::errors::IngestError;

/// Index range owned by partition `index` (1-based) of `workers` over `total`
/// items: `[(i-1)*c, i*c)` clipped to `total`, with `c = ceil(total/workers)`.
pub fn partition_range(total: usize, workers: usize, index: usize) -> Range<usize> {
    let workers = workers.max(1);
    let index = index.clamp(1, workers);
    let chunk = total.div_ceil(workers);
    let start = ((index - 1) * chunk).min(total);
    let end = (index * chunk).min(total);
    start..end
}

/// `i/W` as passed to a child worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    pub index: usize,
    pub workers: usize,
}

impl PartitionSpec {
    pub fn new(index: usize, workers: usize) -> Result<Self, IngestError> {
        if workers == 0 || index == 0 || index > workers {
            return Err(IngestError::InvalidPartition {
                spec: format!("{index}/{workers}"),
                message: "expected 1 <= i <= W".into(),
            });
        }
        Ok(Self { index, workers })
    }

    /// Every partition of a `workers`-way split.
    pub fn all(workers: usize) -> impl Iterator<Item = PartitionSpec> {
        let workers = workers.max(1);
        (1..=workers).map(move |index| PartitionSpec { index, workers })
    }

    pub fn range(&self, total: usize) -> Range<usize> {
        partition_range(total, self.workers, self.index)
    }

    /// Suffix that gives each partition its own checkpoint file.
    pub fn scope_suffix(&self) -> String {
        format!("p{}of{}", self.index, self.workers)
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.workers)
    }
}

impl FromStr for PartitionSpec {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| IngestError::InvalidPartition {
            spec: s.to_string(),
            message: message.to_string(),
        };
        let (i, w) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected i/W"))?;
        let index = i.trim().parse::<usize>().map_err(|_| invalid("index is not a number"))?;
        let workers = w
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid("worker count is not a number"))?;
        PartitionSpec::new(index, workers).map_err(|_| invalid("expected 1 <= i <= W"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_cover_without_gaps_or_overlap() {
        for total in 0..=60 {
            for workers in 1..=12 {
                let mut next = 0;
                for spec in PartitionSpec::all(workers) {
                    let r = spec.range(total);
                    assert_eq!(r.start, next, "gap/overlap at n={total} w={workers} {spec}");
                    assert!(r.end >= r.start);
                    next = r.end;
                }
                assert_eq!(next, total, "n={total} w={workers} not exhaustive");
            }
        }
    }

    #[test]
    fn more_workers_than_items_leaves_tail_empty() {
        assert_eq!(partition_range(3, 5, 1), 0..1);
        assert_eq!(partition_range(3, 5, 3), 2..3);
        assert_eq!(partition_range(3, 5, 4), 3..3);
        assert_eq!(partition_range(3, 5, 5), 3..3);
    }

    #[test]
    fn ceil_sized_slices() {
        assert_eq!(partition_range(10, 3, 1), 0..4);
        assert_eq!(partition_range(10, 3, 2), 4..8);
        assert_eq!(partition_range(10, 3, 3), 8..10);
    }

    #[test]
    fn parses_and_rejects_specs() {
        let spec: PartitionSpec = "2/4".parse().unwrap();
        assert_eq!(spec, PartitionSpec { index: 2, workers: 4 });
        assert_eq!(spec.to_string(), "2/4");
        assert_eq!(spec.scope_suffix(), "p2of4");
        for bad in ["", "2", "0/4", "5/4", "a/4", "1/0", "1/b"] {
            let err = bad.parse::<PartitionSpec>().unwrap_err();
            assert!(err.is_fatal(), "{bad:?} should be rejected");
        }
    }
}
