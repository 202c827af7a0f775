/// 8-bit logical clock used by virtual stigmergy entries.
pub type Lamport = u8;

/// How far ahead a clock may be and still count as newer.
pub const LAMPORT_THRESHOLD: u8 = 50;

/// `a` is newer than `b` if advancing `b` by 1 to [`LAMPORT_THRESHOLD`]
/// ticks, with 8-bit wraparound, reaches `a`.
#[inline]
pub fn is_newer(a: Lamport, b: Lamport) -> bool {
    let ahead = a.wrapping_sub(b);
    (1..=LAMPORT_THRESHOLD).contains(&ahead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_clocks_are_not_newer() {
        for t in [0, 1, 128, 255] {
            assert!(!is_newer(t, t));
        }
    }

    #[test]
    fn threshold_boundaries() {
        assert!(is_newer(50, 0));
        assert!(!is_newer(51, 0));
        assert!(is_newer(100, 50));
        assert!(!is_newer(101, 50));
        assert!(!is_newer(0, 50));
    }

    #[test]
    fn wraparound_edge() {
        assert!(is_newer(0, 255));
        assert!(is_newer(10, 250));
        assert!(is_newer(44, 250));
        assert!(!is_newer(45, 250));
        assert!(!is_newer(250, 10));
    }
}
