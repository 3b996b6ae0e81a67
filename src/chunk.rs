//! Cut file content into content-defined chunks.
//!
//! FastCDC finds cut points from the content itself, so an insertion near
//! the front of a file shifts chunk boundaries only locally and the rest
//! of the file deduplicates against the previous backup.

use std::io::Read;

use fastcdc::v2020::StreamCDC;

use crate::config::ChunkingConfig;
use crate::error::Error;

/// Stream chunks out of a reader without loading the whole file.
///
/// Yields each chunk's bytes in file order. An empty source yields nothing;
/// the backup pipeline synthesizes the single empty chunk an empty file is
/// defined to have.
pub fn chunks<R: Read>(
    reader: R,
    config: &ChunkingConfig,
) -> impl Iterator<Item = crate::error::Result<Vec<u8>>> {
    StreamCDC::new(
        reader,
        config.min_size,
        config.normal_size,
        config.max_size,
    )
    .map(|result| {
        result
            .map(|chunk| chunk.data)
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> ChunkingConfig {
        ChunkingConfig {
            min_size: 1024,
            normal_size: 4096,
            max_size: 16384,
        }
    }

    /// Deterministic pseudo-random bytes; rand would do, but a fixed
    /// stream keeps the cut points stable across runs.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x12345678u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn chunks_reassemble() -> crate::error::Result<()> {
        let input = noise(200 * 1024);
        let config = test_config();

        let chunked: Vec<Vec<u8>> = chunks(input.as_slice(), &config).collect::<Result<_, _>>()?;
        assert!(chunked.len() > 1);

        for (i, chunk) in chunked.iter().enumerate() {
            assert!(chunk.len() <= config.max_size as usize);
            if i + 1 < chunked.len() {
                assert!(chunk.len() >= config.min_size as usize);
            }
        }

        let reassembled: Vec<u8> = chunked.concat();
        assert_eq!(reassembled, input);
        Ok(())
    }

    #[test]
    fn identical_input_chunks_identically() -> crate::error::Result<()> {
        let input = noise(64 * 1024);
        let config = test_config();
        let a: Vec<Vec<u8>> = chunks(input.as_slice(), &config).collect::<Result<_, _>>()?;
        let b: Vec<Vec<u8>> = chunks(input.as_slice(), &config).collect::<Result<_, _>>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let config = test_config();
        assert_eq!(chunks(std::io::empty(), &config).count(), 0);
    }
}
