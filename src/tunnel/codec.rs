//! Fixed-offset big-endian integer encoding for frame headers
//!
//! Callers guarantee the buffer is large enough; an out-of-range offset is a
//! programming error and panics like any slice index.

/// Write `value` as 4 big-endian bytes at `offset`
#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read 4 big-endian bytes at `offset`
#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Write `value` as 2 big-endian bytes at `offset`
#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Read 2 big-endian bytes at `offset`
#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}
