//! Wraparound arithmetic for 16-bit network sequence ids
//!
//! Sequence counters (entity events, chat messages, lobby revisions) are
//! 16-bit and overflow during long sessions, so "newer than" cannot be a
//! plain `>` comparison. An id is considered more recent than another if it
//! is ahead of it by less than half the id space.

/// A 16-bit wraparound sequence id.
pub type NetId = u16;

/// Half of the id space; the window used to decide recency.
pub const HALF_ID_RANGE: u16 = 0x8000;

/// Returns true if `a` is strictly more recent than `b`.
///
/// Equivalent to `((a - b) mod 65536) < 32768` for distinct ids. Equal ids
/// are never more recent than each other.
pub fn id_more_recent(a: NetId, b: NetId) -> bool {
    a != b && a.wrapping_sub(b) < HALF_ID_RANGE
}

/// Returns true if `a` is more recent than or equal to `b`.
///
/// This is the acceptance test for acknowledgements: a duplicate report of
/// the current cursor is idempotent, an older one is stale.
pub fn id_more_recent_or_equal(a: NetId, b: NetId) -> bool {
    a == b || id_more_recent(a, b)
}

/// Signed modular distance from `b` to `a`.
///
/// Positive when `a` is ahead of `b`, negative when behind. The result is
/// always in `-32768..=32767`.
pub fn id_diff(a: NetId, b: NetId) -> i32 {
    i32::from(a.wrapping_sub(b) as i16)
}

/// The id immediately after `id` in wraparound order.
pub fn id_after(id: NetId) -> NetId {
    id.wrapping_add(1)
}

/// The id immediately before `id` in wraparound order.
pub fn id_before(id: NetId) -> NetId {
    id.wrapping_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_recent_without_wraparound() {
        assert!(id_more_recent(5, 3));
        assert!(!id_more_recent(3, 5));
        assert!(!id_more_recent(7, 7));
    }

    #[test]
    fn more_recent_across_wraparound() {
        // 2 comes after 65535 in wraparound order
        assert!(id_more_recent(2, 65535));
        assert!(!id_more_recent(65535, 2));
        // exactly half the range away is treated as old
        assert!(!id_more_recent(0x8000, 0));
        assert!(id_more_recent(0x7fff, 0));
    }

    #[test]
    fn agrees_with_modular_distance() {
        let current: NetId = 60000;
        for offset in [1u16, 100, 0x7ffe, 0x7fff] {
            let newer = current.wrapping_add(offset);
            let distance = u32::from(newer.wrapping_sub(current));
            assert_eq!(
                id_more_recent(newer, current),
                distance < 32768,
                "offset {}",
                offset
            );
        }
        for offset in [0x8000u16, 0x8001, 0xfffe, 0xffff] {
            let older = current.wrapping_add(offset);
            let distance = u32::from(older.wrapping_sub(current));
            assert_eq!(
                id_more_recent(older, current),
                distance < 32768,
                "offset {}",
                offset
            );
        }
    }

    #[test]
    fn transitive_within_single_wrap() {
        // an increasing sequence that wraps once must stay ordered
        let start: NetId = 65500;
        let ids: Vec<NetId> = (0..100).map(|i| start.wrapping_add(i)).collect();
        for window in ids.windows(3) {
            let (a, b, c) = (window[0], window[1], window[2]);
            assert!(id_more_recent(b, a));
            assert!(id_more_recent(c, b));
            assert!(id_more_recent(c, a));
        }
    }

    #[test]
    fn more_recent_or_equal_accepts_duplicates() {
        assert!(id_more_recent_or_equal(9, 9));
        assert!(id_more_recent_or_equal(10, 9));
        assert!(!id_more_recent_or_equal(8, 9));
    }

    #[test]
    fn diff_is_signed_distance() {
        assert_eq!(id_diff(5, 3), 2);
        assert_eq!(id_diff(3, 5), -2);
        assert_eq!(id_diff(2, 65535), 3);
        assert_eq!(id_diff(65535, 2), -3);
    }

    #[test]
    fn successor_and_predecessor_wrap() {
        assert_eq!(id_after(65535), 0);
        assert_eq!(id_before(0), 65535);
        assert_eq!(id_after(41), 42);
    }
}
