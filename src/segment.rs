// Splitting files into DATA payloads and joining them back together.
//
// A transfer always ends with a block shorter than the block size. When a file's length is an
// exact multiple of the block size, that means an extra, empty block has to be sent.

/// Splits `blob` into `block_size` chunks, always ending with a chunk shorter than `block_size`.
///
/// # Panics
///
/// Panics if `block_size` is 0.
pub fn segment(blob: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    assert!(block_size > 0, "block size must be non-zero");

    let mut blocks: Vec<Vec<u8>> = blob.chunks(block_size).map(<[u8]>::to_vec).collect();
    if blob.len() % block_size == 0 {
        blocks.push(Vec::new());
    }
    blocks
}

/// Concatenates received chunks in the order they were accepted.
pub fn reassemble<B: AsRef<[u8]>>(chunks: &[B]) -> Vec<u8> {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut blob = Vec::with_capacity(total);
    for chunk in chunks {
        blob.extend_from_slice(chunk.as_ref());
    }
    blob
}

/// Whether a payload of this length ends a transfer.
pub fn is_terminal(len: usize, block_size: usize) -> bool {
    len < block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_segment_with_remainder() {
        let blob = vec![0x78; 1000];
        let blocks = segment(&blob, 512);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), 512);
        assert_eq!(blocks[1].len(), 488);
    }

    #[test]
    fn test_segment_exact_multiple_appends_empty_block() {
        let blocks = segment(&[0x01; 1024], 512);
        assert_eq!(blocks.iter().map(Vec::len).collect::<Vec<_>>(), vec![512, 512, 0]);
    }

    #[test]
    fn test_segment_empty_file() {
        assert_eq!(segment(&[], 512), vec![Vec::<u8>::new()]);
    }

    #[test]
    #[should_panic(expected = "block size must be non-zero")]
    fn test_segment_zero_block_size() {
        segment(b"abc", 0);
    }

    #[test]
    fn test_only_last_block_is_terminal() {
        let blocks = segment(&[0x00; 2000], 512);
        let (last, rest) = blocks.split_last().unwrap();
        assert!(is_terminal(last.len(), 512));
        assert!(rest.iter().all(|b| !is_terminal(b.len(), 512)));
    }

    #[test]
    fn test_reassemble_inverts_segment() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let len = rng.gen_range(0..4096);
            let block_size = rng.gen_range(1..700);
            let blob: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            assert_eq!(reassemble(&segment(&blob, block_size)), blob);
        }
    }
}
