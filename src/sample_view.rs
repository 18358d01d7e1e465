//! Logic sample view (spec §4.2): a chunk of bit-packed samples as a lazy,
//! finite, non-restartable sequence of `(absolute_samplenum, channel_bytes)`.

use bitvec::prelude::*;

/// Read the little-endian `unitsize`-byte sample at `index` out of `buf` and
/// project it through `channel_map` into one byte per decoder-declared
/// channel: `0xff` for an unmapped optional channel, else the bit value.
pub fn channel_bytes_at(buf: &[u8], index: usize, unitsize: usize, channel_map: &[i32]) -> Vec<u8> {
    let off = index * unitsize;
    let sample = &buf[off..off + unitsize];
    let bits = sample.view_bits::<Lsb0>();
    channel_map
        .iter()
        .map(|&c| {
            if c < 0 {
                0xff
            } else {
                bits[c as usize] as u8
            }
        })
        .collect()
}

/// Finite, non-restartable iterator over one chunk's samples, each
/// projected through a channel map. API v1 decoders consume this directly;
/// API v2 consumes it internally via the condition engine.
pub struct SampleIterator<'a> {
    buf: &'a [u8],
    unitsize: usize,
    channel_map: &'a [i32],
    start_samplenum: u64,
    next_index: usize,
    count: usize,
}

impl<'a> SampleIterator<'a> {
    pub fn new(buf: &'a [u8], unitsize: usize, channel_map: &'a [i32], start_samplenum: u64) -> Self {
        let count = buf.len() / unitsize;
        SampleIterator {
            buf,
            unitsize,
            channel_map,
            start_samplenum,
            next_index: 0,
            count,
        }
    }
}

impl<'a> Iterator for SampleIterator<'a> {
    type Item = (u64, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.count {
            return None;
        }
        let bytes = channel_bytes_at(self.buf, self.next_index, self.unitsize, self.channel_map);
        let samplenum = self.start_samplenum + self.next_index as u64;
        self.next_index += 1;
        Some((samplenum, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_optional_channel_yields_0xff() {
        // channel_map: a -> host 2, b unmapped (optional).
        let map = [2, -1];
        let buf = [0b0000_0101u8];
        let bytes = channel_bytes_at(&buf, 0, 1, &map);
        assert_eq!(bytes, vec![1, 0xff]);
    }

    #[test]
    fn channel_remap_s2_scenario() {
        // Decoder channels ["a", "b"]; host channel map a=2, b=0.
        let map = [2, 0];
        let b1 = [0b0000_0101u8];
        assert_eq!(channel_bytes_at(&b1, 0, 1, &map), vec![1, 1]);
        let b2 = [0b0000_0001u8];
        assert_eq!(channel_bytes_at(&b2, 0, 1, &map), vec![0, 1]);
    }

    #[test]
    fn iterator_is_finite_and_advances_samplenum() {
        let map = [0];
        let buf = [0b1u8, 0b0u8, 0b1u8];
        let mut it = SampleIterator::new(&buf, 1, &map, 100);
        assert_eq!(it.next(), Some((100, vec![1])));
        assert_eq!(it.next(), Some((101, vec![0])));
        assert_eq!(it.next(), Some((102, vec![1])));
        assert_eq!(it.next(), None);
    }
}
