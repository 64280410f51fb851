//! Splits the fetched record set into contiguous batches.

use crate::source::{Record, RecordId};

/// A contiguous slice of the record set, sent to the model in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position in the plan, starting at 0.
    pub index: usize,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.iter().map(|r| &r.id)
    }
}

/// `ceil(records / batch_size)`; a batch size of 0 is treated as 1.
pub fn batch_count(records: usize, batch_size: usize) -> usize {
    records.div_ceil(batch_size.max(1))
}

/// Partition `records` in order. Every batch except possibly the last holds
/// exactly `batch_size` records; no batch is empty.
pub fn plan(records: Vec<Record>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(batch_count(records.len(), batch_size));
    let mut remaining = records.into_iter().peekable();

    while remaining.peek().is_some() {
        let chunk: Vec<Record> = remaining.by_ref().take(batch_size).collect();
        batches.push(Batch {
            index: batches.len(),
            records: chunk,
        });
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::new(format!("r{}", i), "text")).collect()
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(0, 10), 0);
        assert_eq!(batch_count(25, 10), 3);
        assert_eq!(batch_count(30, 10), 3);
        assert_eq!(batch_count(5, 0), 5);
    }

    #[test]
    fn test_plan_partitions_in_order() {
        let batches = plan(records(25), 10);

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let flattened: Vec<String> = batches
            .iter()
            .flat_map(|b| b.ids().map(|id| id.to_string()))
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("r{}", i)).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn test_plan_empty_and_oversized() {
        assert!(plan(Vec::new(), 10).is_empty());

        let batches = plan(records(3), 100);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn test_plan_matches_batch_count() {
        for n in 0..40 {
            for size in 1..12 {
                let batches = plan(records(n), size);
                assert_eq!(batches.len(), batch_count(n, size));
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
            }
        }
    }
}
