//! ## Session-ID Allocator
//!
//! Assigns globally unique, dense, server-scoped 32-bit session identifiers.
//! An id is `(server_id << IBITS) | idx` where `idx` indexes a fixed bitset
//! of `2^IBITS` slots. Sessions use the id as their extranonce prefix, which
//! is why the ids must be dense and unique across the whole pool: the server
//! id makes them unique across servers, the bitset makes them unique within
//! one.

use std::sync::Mutex;

struct AllocatorState {
    words: Vec<u64>,
    count: u32,
    alloc_idx: u32,
    alloc_interval: u32,
}

impl AllocatorState {
    fn test(&self, idx: u32) -> bool {
        self.words[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: u32, value: bool) {
        let word = &mut self.words[(idx / 64) as usize];
        if value {
            *word |= 1u64 << (idx % 64);
        } else {
            *word &= !(1u64 << (idx % 64));
        }
    }
}

/// Bitset allocator for `2^IBITS` session ids, scoped to one `server_id`.
///
/// All operations are mutually exclusive under a single internal lock; this
/// is the one structure that is deliberately callable from any thread.
pub struct SessionIdAllocator<const IBITS: u32> {
    server_id: u8,
    state: Mutex<AllocatorState>,
}

impl<const IBITS: u32> SessionIdAllocator<IBITS> {
    const SESSION_ID_MASK: u32 = (1u32 << IBITS) - 1;

    pub fn new(server_id: u8) -> Self {
        assert!(IBITS <= 24, "IBITS cannot be larger than 24");
        Self {
            server_id,
            state: Mutex::new(AllocatorState {
                words: vec![0u64; (1usize << IBITS).div_ceil(64)],
                count: 0,
                alloc_idx: 0,
                alloc_interval: 0,
            }),
        }
    }

    pub fn server_id(&self) -> u8 {
        self.server_id
    }

    /// Spreads successive allocations apart so a just-freed slot is not
    /// immediately reused. `0` means "next index".
    pub fn set_alloc_interval(&self, interval: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.alloc_interval = interval;
        }
    }

    pub fn is_full(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.count > Self::SESSION_ID_MASK,
            Err(_) => true,
        }
    }

    /// Number of ids currently live.
    pub fn allocated(&self) -> u32 {
        self.state.lock().map(|s| s.count).unwrap_or(0)
    }

    /// Allocates the next free id, scanning from the current cursor and
    /// wrapping within the bitset. Returns `None` when every slot is taken.
    pub fn alloc(&self) -> Option<u32> {
        let mut state = self.state.lock().ok()?;
        if state.count > Self::SESSION_ID_MASK {
            return None;
        }

        // find an empty bit; `count` bounds this scan
        while state.test(state.alloc_idx) {
            state.alloc_idx = (state.alloc_idx + 1) & Self::SESSION_ID_MASK;
        }

        let idx = state.alloc_idx;
        state.set(idx, true);
        state.count += 1;

        state.alloc_idx = idx.wrapping_add(state.alloc_interval) & Self::SESSION_ID_MASK;
        Some(((self.server_id as u32) << IBITS) | idx)
    }

    /// Releases an id back to the bitset. Freeing an id that is not live is
    /// a caller bug.
    pub fn free(&self, session_id: u32) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let idx = session_id & Self::SESSION_ID_MASK;
        debug_assert!(state.test(idx), "freeing a session id that is not live");
        state.set(idx, false);
        state.count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_id_composes_server_id() {
        // sserver.id = 7, IBITS = 24: the very first id is (7 << 24) | 0
        let allocator: SessionIdAllocator<24> = SessionIdAllocator::new(7);
        assert_eq!(allocator.alloc(), Some(0x0700_0000));
    }

    #[test]
    fn test_alloc_interval_skips_freed_slot() {
        let allocator: SessionIdAllocator<24> = SessionIdAllocator::new(7);
        allocator.set_alloc_interval(1);

        let first = allocator.alloc().unwrap();
        assert_eq!(first, 0x0700_0000);
        allocator.free(first);

        // slot 0 is free again, but the cursor already moved past it
        assert_eq!(allocator.alloc(), Some(0x0700_0001));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let allocator: SessionIdAllocator<8> = SessionIdAllocator::new(1);
        let mut ids = Vec::new();
        for _ in 0..256 {
            ids.push(allocator.alloc().expect("bitset not yet full"));
        }
        assert!(allocator.is_full());
        assert_eq!(allocator.alloc(), None);

        allocator.free(ids[100]);
        assert!(!allocator.is_full());
        let reused = allocator.alloc().unwrap();
        assert_eq!(reused & 0xff, 100);
    }

    #[test]
    fn test_count_tracks_live_ids() {
        let allocator: SessionIdAllocator<8> = SessionIdAllocator::new(3);
        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();
        let c = allocator.alloc().unwrap();
        assert_eq!(allocator.allocated(), 3);

        allocator.free(b);
        assert_eq!(allocator.allocated(), 2);
        allocator.free(a);
        allocator.free(c);
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn test_ids_are_unique_while_live() {
        let allocator: SessionIdAllocator<8> = SessionIdAllocator::new(0);
        allocator.set_alloc_interval(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(allocator.alloc().unwrap()));
        }
        assert_eq!(allocator.alloc(), None);
    }
}
