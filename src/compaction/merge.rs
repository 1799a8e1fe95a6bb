//! Merge of delta layer contents
//!
//! Last writer wins per key, with one exception: a superseded record is kept
//! unless the record superseding it lies below the reclaimed floor. Above
//! that floor every sequence is still readable, and the older record is what
//! a reconstruction between the two sequences must see.

use crate::record::{ChangeRecord, Sequence, SequenceRange};

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Kept records, ordered by sequence
    pub records: Vec<ChangeRecord>,
    /// Superseded records dropped
    pub dropped: u64,
}

pub fn merge_records(inputs: Vec<Vec<ChangeRecord>>, reclaimed_floor: Option<Sequence>) -> MergeOutcome {
    let mut all: Vec<ChangeRecord> = inputs.into_iter().flatten().collect();
    all.sort_by(|a, b| a.key.cmp(&b.key).then(a.sequence.cmp(&b.sequence)));
    all.dedup_by(|b, a| a.key == b.key && a.sequence == b.sequence);

    let mut outcome = MergeOutcome::default();
    let mut iter = all.into_iter().peekable();
    while let Some(record) = iter.next() {
        let shadowed = match (iter.peek(), reclaimed_floor) {
            (Some(next), Some(floor)) => next.key == record.key && next.sequence < floor,
            _ => false,
        };
        if shadowed {
            outcome.dropped += 1;
        } else {
            outcome.records.push(record);
        }
    }
    outcome.records.sort_by_key(|r| r.sequence);
    outcome
}

/// Cut sequence-ordered records into outputs of at most `max_records`.
///
/// Output ranges are contiguous and together cover exactly `range`.
pub fn split_outputs(
    records: Vec<ChangeRecord>,
    range: SequenceRange,
    max_records: usize,
) -> Vec<(SequenceRange, Vec<ChangeRecord>)> {
    let mut chunks: Vec<Vec<ChangeRecord>> = Vec::new();
    for record in records {
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < max_records.max(1) => chunk.push(record),
            _ => chunks.push(vec![record]),
        }
    }

    let starts: Vec<Sequence> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| if i == 0 { range.start } else { chunk[0].sequence })
        .collect();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let end = starts.get(i + 1).copied().unwrap_or(range.end);
            (SequenceRange::new(starts[i], end), chunk)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(records: &[ChangeRecord]) -> Vec<u64> {
        records.iter().map(|r| r.sequence.value()).collect()
    }

    #[test]
    fn test_superseded_records_kept_without_floor() {
        let outcome = merge_records(
            vec![
                vec![ChangeRecord::put("a", 1, "x"), ChangeRecord::put("b", 2, "x")],
                vec![ChangeRecord::put("a", 3, "y")],
            ],
            None,
        );
        assert_eq!(seqs(&outcome.records), vec![1, 2, 3]);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_last_writer_wins_below_floor() {
        let outcome = merge_records(
            vec![
                vec![ChangeRecord::put("a", 1, "x"), ChangeRecord::put("a", 2, "y")],
                vec![ChangeRecord::delete("a", 5)],
            ],
            Some(Sequence::new(3)),
        );
        // 1 is shadowed by 2 (< 3); 2 is shadowed by 5 which is still readable
        assert_eq!(seqs(&outcome.records), vec![2, 5]);
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn test_split_covers_range() {
        let records: Vec<ChangeRecord> =
            (3..8).map(|s| ChangeRecord::put(format!("k{}", s), s, "v")).collect();
        let range = SequenceRange::new(Sequence::new(1), Sequence::new(10));
        let outputs = split_outputs(records, range, 2);

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].0, SequenceRange::new(Sequence::new(1), Sequence::new(5)));
        assert_eq!(outputs[1].0, SequenceRange::new(Sequence::new(5), Sequence::new(7)));
        assert_eq!(outputs[2].0, SequenceRange::new(Sequence::new(7), Sequence::new(10)));
        for (range, chunk) in &outputs {
            assert!(chunk.iter().all(|r| range.contains(r.sequence)));
        }
    }
}
