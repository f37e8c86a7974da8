//! RFC 1071 Internet checksum, as used by ICMP: the one's complement of the one's complement
//!  sum of all 16-bit big-endian words. An odd trailing byte is padded with a zero byte.

#[inline]
const fn fold(mut sum: u64) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|word| u16::from_be_bytes([word[0], word[1]]) as u64)
        .sum();
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    fold(sum)
}

/// Computes the checksum to be stored in a frame. The checksum field inside `data` must be
///  zero when this is called.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// A frame with a correct checksum sums up to `0xffff`, including the stored checksum itself.
pub fn verify_checksum(data: &[u8]) -> bool {
    ones_complement_sum(data) == 0xffff
}
