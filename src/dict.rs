//! The string dictionary maps keys (service names, MIME type names,
//! menu paths...) to record offsets in the sycoca file.
//!
//! Rather than hashing whole strings, the dictionary hashes a few
//! character positions, counted from the start (1, 2, ...) or from
//! the end (-1, -2, ...) of each key.  The positions are selected
//! greedily at build time: each round picks the position that spreads
//! the keys over the most distinct table slots, given the positions
//! already picked, and selection stops once no position improves on
//! the previous round.  Keys that still collide share a duplicate
//! chain of `(offset, key)` pairs.
//!
//! Lookups may return an offset for a key that was never added: the
//! caller must decode the record and compare its real key with the
//! query.  Keys that were added are always found.
//!
//! On disk, a dictionary is:
//!
//! ```text
//! u32 table size (0 for an empty dictionary)
//! u32 position count, i32 positions...
//! i32 slots[table size]     0 | record offset | -(duplicate chain offset)
//! duplicate chains          (i32 offset, string key)*, i32 0
//! ```
use std::io::Seek;
use std::io::Write;

use crate::error::DecodeError;
use crate::stream::DataReader;
use crate::stream::DataWriter;

type Decoded<T> = std::result::Result<T, DecodeError>;

/// Running hashes are kept to 30 bits.
const HASH_MASK: u32 = 0x3fff_ffff;

/// Only consider this many positions from either end of the keys.
/// Longer keys still hash fine; we just don't sample their middle.
const MAX_SAMPLE_DISTANCE: usize = 64;

/// Returns the character `pos` selects in `key`, if any.
#[inline]
fn sample(key: &[char], pos: i32) -> Option<u32> {
    let len = key.len();
    let idx = if pos > 0 {
        pos as usize - 1
    } else if pos < 0 {
        // The first character is only reachable from the front.
        let back = pos.unsigned_abs() as usize;
        if back >= len {
            return None;
        }
        len - back
    } else {
        return None;
    };

    key.get(idx).map(|c| *c as u32)
}

#[inline]
fn fold(hash: u32, code: u32) -> u32 {
    (hash.wrapping_mul(13).wrapping_add(code % 29)) & HASH_MASK
}

/// Hashes `key` with the selected sample positions.
fn hash_key(positions: &[i32], key: &[char]) -> u32 {
    positions.iter().fold(0, |hash, pos| match sample(key, *pos) {
        Some(code) => fold(hash, code),
        None => hash,
    })
}

/// Returns the table size for `count` keys: `4 * count + 1`, bumped
/// until it has no factor up to 13.
fn table_size(count: usize) -> u32 {
    let mut size = (count as u32).saturating_mul(4).saturating_add(1);
    while [3, 5, 7, 11, 13].iter().any(|p| size % p == 0) {
        size += 2;
    }

    size
}

struct Candidate {
    key: Vec<char>,
    hash: u32,
}

/// Counts the distinct slots the keys would hit if `pos` were folded
/// into their running hash.
fn diversity(candidates: &[Candidate], pos: i32, size: u32, seen: &mut Vec<bool>) -> usize {
    if pos == 0 {
        return 0;
    }

    seen.clear();
    seen.resize(size as usize, false);
    let mut count = 0;
    for candidate in candidates {
        if let Some(code) = sample(&candidate.key, pos) {
            let slot = (fold(candidate.hash, code) % size) as usize;
            if !seen[slot] {
                seen[slot] = true;
                count += 1;
            }
        }
    }

    count
}

/// Greedily picks sample positions for `keys`.
fn select_positions(keys: &[Vec<char>], size: u32) -> Vec<i32> {
    let max_len = keys
        .iter()
        .map(|k| k.len())
        .max()
        .unwrap_or(0)
        .min(MAX_SAMPLE_DISTANCE) as i32;
    let mut candidates: Vec<Candidate> = keys
        .iter()
        .map(|key| Candidate {
            key: key.clone(),
            hash: 0,
        })
        .collect();

    let mut positions = Vec::new();
    let mut seen = Vec::new();
    // Diversity of each position in the previous round, indexed by
    // `pos + max_len`.
    let mut previous = vec![0usize; (2 * max_len + 1) as usize];
    let mut min_diversity = 0;
    let mut last_best = 0;

    loop {
        let mut best = 0;
        let mut best_pos = 0;
        let mut sum = 0;
        let mut num = 0;

        for pos in -max_len..=max_len {
            let idx = (pos + max_len) as usize;
            // Positions well below the last round's average rarely
            // catch up; skip them for the rest of the search.
            if previous[idx] < min_diversity {
                previous[idx] = 0;
                continue;
            }

            let div = diversity(&candidates, pos, size, &mut seen);
            if div > best {
                best = div;
                best_pos = pos;
            }

            previous[idx] = div;
            sum += div;
            num += 1;
        }

        if num > 0 {
            min_diversity = (3 * sum) / (4 * num);
        }

        if best <= last_best {
            break;
        }

        last_best = best;
        for candidate in candidates.iter_mut() {
            if let Some(code) = sample(&candidate.key, best_pos) {
                candidate.hash = fold(candidate.hash, code);
            }
        }
        positions.push(best_pos);
    }

    positions
}

/// Accumulates keys during a build, and writes the dictionary once
/// the offsets of all records are known.
#[derive(Clone, Debug, Default)]
pub struct DictBuilder {
    entries: Vec<(String, i32)>,
}

impl DictBuilder {
    pub fn new() -> DictBuilder {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maps `key` to the record at `offset`.  Empty keys and the null
    /// offset are never stored.
    pub fn add(&mut self, key: impl Into<String>, offset: i32) {
        let key = key.into();
        if key.is_empty() || offset <= 0 {
            tracing::debug!(target: "sycoca", key = %key, offset, "not adding dictionary entry");
            return;
        }

        self.entries.push((key, offset));
    }

    /// Removes the first entry for `key`, if any.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Writes the dictionary at the writer's current position.
    pub fn save<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        if self.entries.is_empty() {
            writer.write_u32(0)?;
            return writer.write_u32(0);
        }

        let keys: Vec<Vec<char>> = self.entries.iter().map(|(k, _)| k.chars().collect()).collect();
        let size = table_size(keys.len());
        let positions = select_positions(&keys, size);

        // For each slot, the indices of the entries that hash there.
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); size as usize];
        for (idx, key) in keys.iter().enumerate() {
            buckets[(hash_key(&positions, key) % size) as usize].push(idx);
        }

        writer.write_u32(size)?;
        writer.write_u32(positions.len() as u32)?;
        for pos in &positions {
            writer.write_i32(*pos)?;
        }

        // The table needs the chains' offsets, and the chains come
        // after the table: write everything twice, and the second
        // pass sees the offsets recorded by the first.
        let table_start = writer.position();
        let mut chain_offsets = vec![0i32; size as usize];
        for _pass in 0..2 {
            writer.seek_to(table_start)?;
            for (slot, bucket) in buckets.iter().enumerate() {
                let value = match bucket.len() {
                    0 => 0,
                    1 => self.entries[bucket[0]].1,
                    _ => -chain_offsets[slot],
                };
                writer.write_i32(value)?;
            }

            for (slot, bucket) in buckets.iter().enumerate() {
                if bucket.len() < 2 {
                    continue;
                }

                chain_offsets[slot] = writer.offset()?;
                for idx in bucket {
                    let (key, offset) = &self.entries[*idx];
                    writer.write_i32(*offset)?;
                    writer.write_string(key)?;
                }
                writer.write_i32(0)?;
            }
        }

        Ok(())
    }
}

/// Read-only view of a dictionary in a sycoca file.
#[derive(Clone, Debug)]
pub struct Dict<'a> {
    data: &'a [u8],
    size: u32,
    positions: Vec<i32>,
    table: usize,
}

impl<'a> Dict<'a> {
    /// Reads the dictionary header at `offset`.
    pub fn read(data: &'a [u8], offset: i32) -> Decoded<Dict<'a>> {
        let mut reader = DataReader::at(data, offset.into())?;
        let size = reader.read_u32()?;
        let count = reader.read_count(4)?;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            positions.push(reader.read_i32()?);
        }

        let table = reader.position();
        if u64::from(size) * 4 > reader.remaining() as u64 {
            return Err(DecodeError::Oversized {
                at: table,
                len: size.into(),
            });
        }

        Ok(Dict {
            data,
            size,
            positions,
            table,
        })
    }

    /// Returns the offset of the record for `key`, or 0.  A non-zero
    /// result for a key that was never added is possible; callers
    /// must check the record's key.
    pub fn find(&self, key: &str) -> Decoded<i32> {
        if self.size == 0 || key.is_empty() {
            return Ok(0);
        }

        let chars: Vec<char> = key.chars().collect();
        let slot = hash_key(&self.positions, &chars) % self.size;
        let mut reader = DataReader::at(self.data, (self.table + 4 * slot as usize) as i64)?;
        let value = reader.read_i32()?;
        if value >= 0 {
            return Ok(value);
        }

        reader.seek(-i64::from(value))?;
        loop {
            let offset = reader.read_i32()?;
            if offset == 0 {
                return Ok(0);
            }

            if reader.read_string()? == key {
                return Ok(offset);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dict::*;
    use proptest::collection::hash_set;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn saved(builder: &DictBuilder) -> Vec<u8> {
        let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
        // Dictionaries never start at offset 0 in a real file.
        writer.write_u32(0).expect("write must succeed");
        builder.save(&mut writer).expect("save must succeed");
        writer.into_inner().expect("flush").into_inner()
    }

    #[test]
    fn test_table_size() {
        // 5, 7, 9, 11, 13 and 15 all have a small factor.
        assert_eq!(table_size(1), 17);
        assert_eq!(table_size(4), 17);
        assert_eq!(table_size(0), 1);
    }

    #[test]
    fn test_sample_positions() {
        let key: Vec<char> = "hello".chars().collect();
        assert_eq!(sample(&key, 1), Some('h' as u32));
        assert_eq!(sample(&key, 5), Some('o' as u32));
        assert_eq!(sample(&key, 6), None);
        assert_eq!(sample(&key, -1), Some('o' as u32));
        assert_eq!(sample(&key, -4), Some('e' as u32));
        // The first character is only reachable as position 1.
        assert_eq!(sample(&key, -5), None);
        assert_eq!(sample(&key, 0), None);
    }

    #[test]
    fn test_empty_dict() {
        let bytes = saved(&DictBuilder::new());
        assert_eq!(bytes, vec![0; 12]);

        let dict = Dict::read(&bytes, 4).expect("read must succeed");
        assert_eq!(dict.find("anything"), Ok(0));
    }

    #[test]
    fn test_add_ignores_invalid() {
        let mut builder = DictBuilder::new();
        builder.add("", 12);
        builder.add("key", 0);
        assert!(builder.is_empty());

        builder.add("key", 12);
        assert_eq!(builder.len(), 1);
        assert!(!builder.remove("other"));
        assert!(builder.remove("key"));
        assert!(builder.is_empty());
    }

    #[test]
    fn test_find() {
        let mut builder = DictBuilder::new();
        builder.add("text/plain", 100);
        builder.add("text/html", 200);
        builder.add("image/png", 300);

        let bytes = saved(&builder);
        let dict = Dict::read(&bytes, 4).expect("read must succeed");
        assert_eq!(dict.find("text/plain"), Ok(100));
        assert_eq!(dict.find("text/html"), Ok(200));
        assert_eq!(dict.find("image/png"), Ok(300));
        assert_eq!(dict.find(""), Ok(0));
    }

    /// Keys made of 'a' (97) and '~' (126 = 97 + 29) have the same
    /// hash for every choice of positions, so they all land in one
    /// duplicate chain.
    #[test]
    fn test_duplicate_chain() {
        let mut builder = DictBuilder::new();
        builder.add("a~a", 100);
        builder.add("~a~", 200);
        builder.add("aa~", 300);
        builder.add("~~~", 400);
        builder.add("hello", 500);
        builder.add("world", 600);
        assert!(builder.remove("aa~"));

        let bytes = saved(&builder);
        let dict = Dict::read(&bytes, 4).expect("read must succeed");
        assert_eq!(dict.find("a~a"), Ok(100));
        assert_eq!(dict.find("~a~"), Ok(200));
        assert_eq!(dict.find("~~~"), Ok(400));
        assert_eq!(dict.find("hello"), Ok(500));
        assert_eq!(dict.find("world"), Ok(600));
        // Same chain, but the key comparison rules it out.
        assert_eq!(dict.find("aa~"), Ok(0));
        assert_eq!(dict.find("aaa"), Ok(0));
    }

    /// A truncated table is detected when the dictionary is opened.
    #[test]
    fn test_truncated() {
        let mut builder = DictBuilder::new();
        builder.add("x", 100);
        let bytes = saved(&builder);

        assert!(Dict::read(&bytes[..bytes.len() - 1], 4).is_err());
        assert!(Dict::read(&bytes, bytes.len() as i32 + 4).is_err());
    }

    proptest! {
        /// Every key we add is found with its offset; other keys map
        /// to nothing, or to a record whose real key differs.
        #[test]
        fn test_round_trip(keys in hash_set("[a-zA-Z0-9/._-]{1,24}", 1..200usize),
                           probes in hash_set("[a-z/.]{1,12}", 0..50usize)) {
            let mut builder = DictBuilder::new();
            let mut expected = HashMap::new();
            for (idx, key) in keys.iter().enumerate() {
                let offset = 16 * (idx as i32 + 1);
                builder.add(key.clone(), offset);
                expected.insert(key.clone(), offset);
            }

            let bytes = saved(&builder);
            let dict = Dict::read(&bytes, 4).expect("read must succeed");
            for (key, offset) in &expected {
                assert_eq!(dict.find(key), Ok(*offset));
            }

            let by_offset: HashMap<i32, &String> = expected.iter().map(|(k, v)| (*v, k)).collect();
            for probe in probes.iter().filter(|p| !expected.contains_key(*p)) {
                let found = dict.find(probe).expect("find must succeed");
                if found != 0 {
                    let real_key = by_offset.get(&found).expect("offsets point to records");
                    assert_ne!(*real_key, probe);
                }
            }
        }
    }
}
