//! Batch former. Packs change records into delivery chunks under
//! the record and byte caps without ever splitting a transaction
//! across chunks, unless the transaction alone overflows a cap.

use crate::backend::replication::Lsn;
use crate::net::{ChangeRecord, Sequence};

/// One outbound message worth of records.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub records: Vec<ChangeRecord>,
    /// Set when one transaction had to be split: position within
    /// the split.
    pub split: Option<Sequence>,
    pub last_lsn: Lsn,
}

impl Chunk {
    fn new(records: Vec<ChangeRecord>, split: Option<Sequence>) -> Self {
        let last_lsn = records.last().map(|r| r.lsn).unwrap_or(Lsn::ZERO);
        Self {
            records,
            split,
            last_lsn,
        }
    }
}

/// Form chunks out of records already in LSN order.
///
/// Contiguous records with the same `xid` are one transaction and
/// stay together. A transaction that alone overflows a cap is
/// split into tagged chunks; a single record over the byte cap
/// goes out whole, atomicity wins.
pub fn chunk(records: &[ChangeRecord], max_records: usize, max_bytes: usize) -> Vec<Chunk> {
    let mut chunks = vec![];
    let mut current: Vec<ChangeRecord> = vec![];
    let mut current_bytes = 0;

    for group in transactions(records) {
        let group_bytes: usize = group.iter().map(|r| r.wire_size()).sum();

        if group.len() > max_records || group_bytes > max_bytes {
            // Oversized transaction: flush whatever is pending,
            // then split the transaction on its own.
            if !current.is_empty() {
                chunks.push(Chunk::new(std::mem::take(&mut current), None));
                current_bytes = 0;
            }

            chunks.extend(split_transaction(group, max_records, max_bytes));
            continue;
        }

        let overflows = !current.is_empty()
            && (current.len() + group.len() > max_records
                || current_bytes + group_bytes > max_bytes);

        if overflows {
            chunks.push(Chunk::new(std::mem::take(&mut current), None));
            current_bytes = 0;
        }

        current.extend(group.iter().cloned());
        current_bytes += group_bytes;
    }

    if !current.is_empty() {
        chunks.push(Chunk::new(current, None));
    }

    chunks
}

// Split one oversized transaction into chunks tagged with their
// position, so the client holds off applying until all arrive.
fn split_transaction(group: &[ChangeRecord], max_records: usize, max_bytes: usize) -> Vec<Chunk> {
    let mut parts: Vec<Vec<ChangeRecord>> = vec![];
    let mut part: Vec<ChangeRecord> = vec![];
    let mut part_bytes = 0;

    for record in group {
        let bytes = record.wire_size();
        let full = !part.is_empty() && (part.len() >= max_records || part_bytes + bytes > max_bytes);

        if full {
            parts.push(std::mem::take(&mut part));
            part_bytes = 0;
        }

        part.push(record.clone());
        part_bytes += bytes;
    }

    if !part.is_empty() {
        parts.push(part);
    }

    let total = parts.len() as u32;
    parts
        .into_iter()
        .enumerate()
        .map(|(i, records)| {
            let split = (total > 1).then_some(Sequence {
                chunk: i as u32 + 1,
                total,
            });
            Chunk::new(records, split)
        })
        .collect()
}

/// Group contiguous records by transaction. Records without an
/// xid are their own group.
pub fn transactions(records: &[ChangeRecord]) -> Vec<&[ChangeRecord]> {
    let mut groups = vec![];
    let mut start = 0;

    for i in 1..=records.len() {
        let boundary = match records.get(i) {
            Some(record) => match (&record.xid, &records[i - 1].xid) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            },
            None => true,
        };

        if boundary {
            groups.push(&records[start..i]);
            start = i;
        }
    }

    groups
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::Operation;
    use chrono::Utc;
    use serde_json::json;

    fn record(lsn: u64, xid: Option<&str>) -> ChangeRecord {
        ChangeRecord {
            table: "tasks".into(),
            operation: Operation::Insert,
            data: json!({"id": format!("T{}", lsn)}),
            updated_at: Utc::now(),
            lsn: Lsn::from_u64(lsn),
            xid: xid.map(String::from),
        }
    }

    #[test]
    fn test_transaction_grouping() {
        let records = vec![
            record(1, Some("a")),
            record(2, Some("a")),
            record(3, Some("b")),
            record(4, None),
            record(5, None),
        ];

        let groups = transactions(&records);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
    }

    #[test]
    fn test_small_batch_single_chunk() {
        let records = vec![record(1, Some("a")), record(2, Some("b"))];
        let chunks = chunk(&records, 500, 512 * 1024);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].records.len(), 2);
        assert!(chunks[0].split.is_none());
        assert_eq!(chunks[0].last_lsn, Lsn::from_u64(2));
    }

    #[test]
    fn test_transaction_never_straddles_chunks() {
        // Three records of "b" don't fit next to two of "a" with a
        // cap of four, so "b" moves whole into the next chunk.
        let records = vec![
            record(1, Some("a")),
            record(2, Some("a")),
            record(3, Some("b")),
            record(4, Some("b")),
            record(5, Some("b")),
        ];

        let chunks = chunk(&records, 4, usize::MAX);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].records.len(), 2);
        assert_eq!(chunks[1].records.len(), 3);
        assert!(chunks.iter().all(|c| c.split.is_none()));
    }

    #[test]
    fn test_oversized_transaction_split_with_sequence() {
        let records: Vec<ChangeRecord> =
            (1..=900).map(|lsn| record(lsn, Some("big"))).collect();

        let chunks = chunk(&records, 500, usize::MAX);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].records.len(), 500);
        assert_eq!(chunks[1].records.len(), 400);
        assert_eq!(chunks[0].split, Some(Sequence { chunk: 1, total: 2 }));
        assert_eq!(chunks[1].split, Some(Sequence { chunk: 2, total: 2 }));
        assert_eq!(chunks[1].last_lsn, Lsn::from_u64(900));
    }

    #[test]
    fn test_single_record_over_byte_cap_goes_whole() {
        let mut big = record(1, Some("a"));
        big.data = json!({"id": "T1", "blob": "x".repeat(4096)});

        let chunks = chunk(&[big], 500, 64);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].records.len(), 1);
        assert!(chunks[0].split.is_none());
    }

    #[test]
    fn test_byte_cap_flushes() {
        let records = vec![record(1, Some("a")), record(2, Some("b")), record(3, Some("c"))];
        let one = records[0].wire_size();

        // Room for two records per chunk.
        let chunks = chunk(&records, 500, one * 2 + 8);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].records.len(), 2);
        assert_eq!(chunks[1].records.len(), 1);
    }

    #[test]
    fn test_empty() {
        assert!(chunk(&[], 500, 512).is_empty());
        assert!(transactions(&[]).is_empty());
    }
}
