/// Splitting items into chunks and putting them back together.
///
/// `split` is deterministic: the same bytes and chunk size always give the
/// same index assignment, so a retransmitted packet carries exactly the
/// chunk the receiver expects at that index.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::FrameError;

/// A named byte payload transferred as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    pub data: Bytes,
}

impl Item {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// One chunk of an item and its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: u32,
    pub total: u32,
    pub chunk: Bytes,
}

/// Number of chunks for `len` bytes. An empty item still takes one chunk.
pub fn chunk_count(len: usize, max_chunk_size: usize) -> Result<u32, FrameError> {
    if max_chunk_size == 0 {
        return Err(FrameError::ChunkTooSmall);
    }
    let count = len.div_ceil(max_chunk_size).max(1);
    u32::try_from(count).map_err(|_| FrameError::TooManyChunks {
        size: len,
        max: u32::MAX,
    })
}

/// Split `data` into fragments of at most `max_chunk_size` bytes.
/// Chunks are zero-copy slices of `data`.
pub fn split(data: &Bytes, max_chunk_size: usize) -> Result<Vec<Fragment>, FrameError> {
    let total = chunk_count(data.len(), max_chunk_size)?;
    let fragments = (0..total)
        .map(|index| {
            let start = (index as usize * max_chunk_size).min(data.len());
            let end = (start + max_chunk_size).min(data.len());
            Fragment {
                index,
                total,
                chunk: data.slice(start..end),
            }
        })
        .collect();
    Ok(fragments)
}

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    /// First copy of this index.
    Stored,
    /// Same index, same bytes. Nothing changed.
    Duplicate,
    /// Same index, different bytes. The first copy was kept.
    Conflict,
}

/// Chunks received so far for one item.
#[derive(Debug)]
pub struct Reassembly {
    total: u32,
    chunks: HashMap<u32, Bytes>,
    bytes: usize,
}

impl Reassembly {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            chunks: HashMap::new(),
            bytes: 0,
        }
    }

    pub fn insert(&mut self, index: u32, chunk: Bytes) -> Result<ChunkInsert, FrameError> {
        if index >= self.total {
            return Err(FrameError::Malformed("sequence index outside total count"));
        }
        if let Some(existing) = self.chunks.get(&index) {
            return Ok(if *existing == chunk {
                ChunkInsert::Duplicate
            } else {
                ChunkInsert::Conflict
            });
        }
        self.bytes += chunk.len();
        self.chunks.insert(index, chunk);
        Ok(ChunkInsert::Stored)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.chunks.len() as u64 >= self.total as u64
    }

    #[inline]
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Plaintext bytes held.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Concatenate all chunks in index order.
    pub fn finish(mut self) -> Result<Vec<u8>, FrameError> {
        if !self.is_complete() {
            return Err(FrameError::Incomplete {
                missing: self.total as usize - self.chunks.len(),
                total: self.total,
            });
        }
        let mut out = Vec::with_capacity(self.bytes);
        for index in 0..self.total {
            match self.chunks.remove(&index) {
                Some(chunk) => out.extend_from_slice(&chunk),
                None => {
                    return Err(FrameError::Incomplete {
                        missing: 1,
                        total: self.total,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Rebuild an item from `(index, chunk)` pairs in any order.
pub fn reassemble<I>(total: u32, fragments: I) -> Result<Vec<u8>, FrameError>
where
    I: IntoIterator<Item = (u32, Bytes)>,
{
    let mut reassembly = Reassembly::new(total);
    for (index, chunk) in fragments {
        reassembly.insert(index, chunk)?;
    }
    reassembly.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn pattern(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn hello_world_in_three_chunks() {
        let data = Bytes::from_static(b"Hello World!");
        let fragments = split(&data, 5).unwrap();
        let chunks: Vec<&[u8]> = fragments.iter().map(|f| &f.chunk[..]).collect();
        assert_eq!(chunks, vec![&b"Hello"[..], &b" Worl"[..], &b"d!"[..]]);
        assert!(fragments.iter().all(|f| f.total == 3));
    }

    #[test]
    fn empty_item_is_one_empty_chunk() {
        let fragments = split(&Bytes::new(), 5).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total, 1);
        assert!(fragments[0].chunk.is_empty());
        assert_eq!(
            reassemble(1, fragments.into_iter().map(|f| (f.index, f.chunk))).unwrap(),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn exact_chunk_boundary() {
        let fragments = split(&pattern(15), 5).unwrap();
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.chunk.len() == 5));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            split(&pattern(3), 0),
            Err(FrameError::ChunkTooSmall)
        ));
    }

    #[test]
    fn split_is_deterministic() {
        let data = pattern(1000);
        assert_eq!(split(&data, 64).unwrap(), split(&data, 64).unwrap());
    }

    #[test]
    fn shuffled_reassembly_restores_item() {
        let mut rng = rand::rng();
        for len in [0usize, 1, 4, 5, 6, 99, 100, 101, 1024, 4097] {
            for chunk_size in [1usize, 5, 64, 1024] {
                let data = pattern(len);
                let mut fragments = split(&data, chunk_size).unwrap();
                let total = fragments[0].total;
                fragments.shuffle(&mut rng);
                let rebuilt =
                    reassemble(total, fragments.into_iter().map(|f| (f.index, f.chunk))).unwrap();
                assert_eq!(rebuilt, data, "len={} chunk_size={}", len, chunk_size);
            }
        }
    }

    #[test]
    fn missing_chunk_is_incomplete() {
        let data = pattern(20);
        let fragments = split(&data, 5).unwrap();
        let partial = fragments
            .into_iter()
            .filter(|f| f.index != 2)
            .map(|f| (f.index, f.chunk));
        assert!(matches!(
            reassemble(4, partial),
            Err(FrameError::Incomplete { missing: 1, total: 4 })
        ));
    }

    #[test]
    fn duplicates_are_idempotent_and_conflicts_keep_first() {
        let mut r = Reassembly::new(2);
        assert_eq!(
            r.insert(0, Bytes::from_static(b"ab")).unwrap(),
            ChunkInsert::Stored
        );
        assert_eq!(
            r.insert(0, Bytes::from_static(b"ab")).unwrap(),
            ChunkInsert::Duplicate
        );
        assert_eq!(
            r.insert(0, Bytes::from_static(b"zz")).unwrap(),
            ChunkInsert::Conflict
        );
        assert_eq!(r.received(), 1);
        assert_eq!(r.bytes(), 2);
        assert!(!r.is_complete());

        r.insert(1, Bytes::from_static(b"cd")).unwrap();
        assert_eq!(r.finish().unwrap(), b"abcd");
    }

    #[test]
    fn index_outside_total_rejected() {
        let mut r = Reassembly::new(2);
        assert!(r.insert(2, Bytes::new()).is_err());
    }
}
