//! Output held back while the interceptor owns the screen.

use std::collections::VecDeque;

use resh_core::constants::OUTPUT_CACHE_CHUNK;

use crate::pipeline::OutputStream;

#[derive(Debug)]
struct CacheChunk {
    stream: OutputStream,
    data: Vec<u8>,
}

/// Ordered cache of remote output across both streams.
///
/// Appends go into the tail chunk while it has room; a new chunk is at
/// least [`OUTPUT_CACHE_CHUNK`] bytes so appending never reallocates
/// earlier data.
#[derive(Debug, Default)]
pub struct OutputCache {
    chunks: VecDeque<CacheChunk>,
    len: usize,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stream: OutputStream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        if let Some(tail) = self.chunks.back_mut()
            && tail.stream == stream
            && tail.data.capacity() - tail.data.len() >= data.len()
        {
            tail.data.extend_from_slice(data);
            return;
        }
        let mut chunk = Vec::with_capacity(OUTPUT_CACHE_CHUNK.max(data.len()));
        chunk.extend_from_slice(data);
        self.chunks.push_back(CacheChunk {
            stream,
            data: chunk,
        });
    }

    /// Take everything cached, oldest first.
    pub fn drain(&mut self) -> Vec<(OutputStream, Vec<u8>)> {
        self.len = 0;
        self.chunks.drain(..).map(|c| (c.stream, c.data)).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn keeps_order_across_streams() {
        let mut cache = OutputCache::new();
        cache.push(OutputStream::Stdout, b"a");
        cache.push(OutputStream::Stdout, b"b");
        cache.push(OutputStream::Stderr, b"E");
        cache.push(OutputStream::Stdout, b"c");
        assert_eq!(cache.len(), 4);

        let drained = cache.drain();
        assert_eq!(
            drained,
            vec![
                (OutputStream::Stdout, b"ab".to_vec()),
                (OutputStream::Stderr, b"E".to_vec()),
                (OutputStream::Stdout, b"c".to_vec()),
            ]
        );
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn large_writes_get_their_own_chunk() {
        let mut cache = OutputCache::new();
        cache.push(OutputStream::Stdout, b"head");
        let big = vec![b'x'; OUTPUT_CACHE_CHUNK];
        cache.push(OutputStream::Stdout, &big);
        cache.push(OutputStream::Stdout, b"tail");

        assert_eq!(cache.len(), OUTPUT_CACHE_CHUNK + 8);

        let drained = cache.drain();
        assert_eq!(drained[0].1, b"head");
        assert_eq!(&drained[1].1[..big.len()], &big[..]);
        let all: Vec<u8> = drained.into_iter().flat_map(|(_, d)| d).collect();
        assert!(all.ends_with(b"xtail"));
        assert_eq!(all.len(), OUTPUT_CACHE_CHUNK + 8);
    }

    #[test]
    fn empty_pushes_are_ignored() {
        let mut cache = OutputCache::new();
        cache.push(OutputStream::Stderr, b"");
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }

    fn arb_push() -> impl Strategy<Value = (OutputStream, Vec<u8>)> {
        let stream = prop_oneof![3 => Just(OutputStream::Stdout), 1 => Just(OutputStream::Stderr)];
        let data = prop_oneof![
            6 => proptest::collection::vec(any::<u8>(), 0..64),
            2 => proptest::collection::vec(any::<u8>(), 1024..20_000),
            1 => proptest::collection::vec(any::<u8>(), OUTPUT_CACHE_CHUNK - 8..OUTPUT_CACHE_CHUNK + 8),
        ];
        (stream, data)
    }

    /// Flatten to one `(stream, byte)` per byte so chunking does not matter.
    fn tagged<'a>(
        items: impl IntoIterator<Item = &'a (OutputStream, Vec<u8>)>,
    ) -> Vec<(OutputStream, u8)> {
        items
            .into_iter()
            .flat_map(|(stream, data)| data.iter().map(move |b| (*stream, *b)))
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn drain_replays_pushes_in_order(pushes in proptest::collection::vec(arb_push(), 0..24)) {
            let mut cache = OutputCache::new();
            for (stream, data) in &pushes {
                cache.push(*stream, data);
            }
            let total: usize = pushes.iter().map(|(_, d)| d.len()).sum();
            prop_assert_eq!(cache.len(), total);

            let drained = cache.drain();
            prop_assert!(drained.iter().all(|(_, d)| !d.is_empty()));
            prop_assert_eq!(tagged(&drained), tagged(&pushes));
            prop_assert!(cache.is_empty());
        }
    }
}
