//! Container-header detection (§3 `Media Chunk`, `Captured Header`).

/// Magic bytes opening a WebM/Matroska container (the EBML header ID).
pub const MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Scans the leading `limit` bytes of `buf` for [`MAGIC`], returning the
/// offset of its first occurrence if found within that window.
#[must_use]
pub fn find_magic(buf: &[u8], limit: usize) -> Option<usize> {
    let window = &buf[..buf.len().min(limit)];
    window
        .windows(MAGIC.len())
        .position(|w| w == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_magic_at_start() {
        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(b"trailing data");
        assert_eq!(find_magic(&buf, 8192), Some(0));
    }

    #[test]
    fn finds_magic_with_leading_padding() {
        let mut buf = vec![0u8; 16];
        buf.extend_from_slice(&MAGIC);
        assert_eq!(find_magic(&buf, 8192), Some(16));
    }

    #[test]
    fn absent_magic_returns_none() {
        let buf = vec![0u8; 64];
        assert_eq!(find_magic(&buf, 8192), None);
    }

    #[test]
    fn magic_outside_scan_limit_is_not_found() {
        let mut buf = vec![0u8; 100];
        buf.extend_from_slice(&MAGIC);
        assert_eq!(find_magic(&buf, 50), None);
    }
}
