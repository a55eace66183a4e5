//! VoicePool: fixed-capacity voice allocation with voice stealing.

use alloc::vec::Vec;
use tracing::debug;

use crate::pool::{Pool, PoolId};
use crate::voice::{Voice, VoiceState};

/// Pool of voices shared by all channels of an engine.
pub struct VoicePool {
    voices: Pool<Voice>,
    /// Live voices, oldest first.
    order: Vec<PoolId>,
    /// Reclaim a busy voice when the pool is exhausted.
    stealing: bool,
}

/// Steal priority, lowest first: voices already fading out are nearly
/// silent, released ones are on their way out.
fn steal_priority(state: VoiceState) -> u8 {
    match state {
        VoiceState::Free => 0,
        VoiceState::FadingOut => 1,
        VoiceState::Releasing => 2,
        VoiceState::Allocated | VoiceState::Triggered | VoiceState::Sustaining => 3,
    }
}

impl VoicePool {
    /// Create a pool of `capacity` voices.
    pub fn new(capacity: usize, stealing: bool) -> Self {
        Self {
            voices: Pool::with_capacity(capacity, Voice::default),
            order: Vec::with_capacity(capacity),
            stealing,
        }
    }

    /// Claim a voice slot.
    ///
    /// When the pool is full and stealing is enabled, the oldest voice of the
    /// lowest steal priority is reclaimed. Returns `None` if nothing could be
    /// claimed; the caller skips the trigger.
    pub fn allocate(&mut self) -> Option<PoolId> {
        if self.voices.available() == 0 {
            if !self.stealing {
                return None;
            }
            let victim = self.find_steal_candidate()?;
            debug!(voice = victim.raw(), "stealing voice");
            self.free(victim);
        }
        let id = self.voices.allocate()?;
        if let Some(voice) = self.voices.get_mut(id) {
            voice.state = VoiceState::Allocated;
        }
        self.order.push(id);
        Some(id)
    }

    /// Best voice to steal: lowest priority, oldest first.
    fn find_steal_candidate(&self) -> Option<PoolId> {
        self.order
            .iter()
            .filter_map(|&id| self.voices.get(id).map(|v| (id, steal_priority(v.state))))
            .min_by_key(|&(_, p)| p)
            .map(|(id, _)| id)
    }

    pub fn get(&self, id: PoolId) -> Option<&Voice> {
        self.voices.get(id)
    }

    pub fn get_mut(&mut self, id: PoolId) -> Option<&mut Voice> {
        self.voices.get_mut(id)
    }

    /// Return a voice slot to the pool immediately.
    pub fn free(&mut self, id: PoolId) {
        if let Some(voice) = self.voices.get_mut(id) {
            voice.state = VoiceState::Free;
        }
        if self.voices.free(id) {
            if let Some(idx) = self.order.iter().position(|&v| v == id) {
                self.order.remove(idx);
            }
        }
    }

    /// Start a release on a voice at frame `pos`.
    pub fn release(&mut self, id: PoolId, pos: u32) {
        if let Some(voice) = self.get_mut(id) {
            voice.release(pos);
        }
    }

    /// Fast-kill a voice from frame `pos` on.
    pub fn kill(&mut self, id: PoolId, pos: u32) {
        if let Some(voice) = self.get_mut(id) {
            voice.kill(pos);
        }
    }

    /// Free voices that finished playing, reporting each to `on_free`.
    pub fn reap_finished(&mut self, mut on_free: impl FnMut(PoolId, &Voice)) {
        let mut i = 0;
        while i < self.order.len() {
            let id = self.order[i];
            match self.voices.get(id) {
                Some(voice) if voice.is_active() => i += 1,
                Some(voice) => {
                    on_free(id, voice);
                    self.voices.free(id);
                    self.order.remove(i);
                }
                None => {
                    self.order.remove(i);
                }
            }
        }
    }

    /// Live voices, oldest first.
    pub fn ids(&self) -> &[PoolId] {
        &self.order
    }

    /// Count of occupied voice slots.
    pub fn active_count(&self) -> usize {
        self.order.len()
    }

    pub fn capacity(&self) -> usize {
        self.voices.capacity()
    }

    /// Drop every voice.
    pub fn clear(&mut self) {
        for id in self.order.drain(..) {
            self.voices.free(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_pool(n: usize) -> (VoicePool, Vec<PoolId>) {
        let mut pool = VoicePool::new(n, true);
        let ids = (0..n).map(|_| pool.allocate().unwrap()).collect();
        (pool, ids)
    }

    // === Allocation tests ===

    #[test]
    fn pool_new_is_empty() {
        let pool = VoicePool::new(8, true);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.capacity(), 8);
    }

    #[test]
    fn pool_allocate_returns_valid_id() {
        let mut pool = VoicePool::new(8, true);
        let id = pool.allocate().unwrap();
        assert_eq!(pool.get(id).unwrap().state, VoiceState::Allocated);
    }

    #[test]
    fn pool_allocate_multiple() {
        let mut pool = VoicePool::new(8, true);
        let id1 = pool.allocate().unwrap();
        let id2 = pool.allocate().unwrap();
        assert_ne!(id1, id2);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn pool_free_invalidates_id() {
        let mut pool = VoicePool::new(8, true);
        let id = pool.allocate().unwrap();
        pool.free(id);
        assert!(pool.get(id).is_none());
        assert_eq!(pool.active_count(), 0);
        // The slot comes back under a new id.
        let again = pool.allocate().unwrap();
        assert_eq!(again.index(), id.index());
        assert_ne!(again, id);
    }

    #[test]
    fn pool_reap_removes_finished() {
        let mut pool = VoicePool::new(8, true);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.get_mut(a).unwrap().state = VoiceState::Free;
        let mut reaped = Vec::new();
        pool.reap_finished(|id, _| reaped.push(id));
        assert_eq!(reaped, vec![a]);
        assert_eq!(pool.ids(), &[b]);
    }

    // === Stealing tests ===

    #[test]
    fn pool_without_stealing_refuses_when_full() {
        let mut pool = VoicePool::new(2, false);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn pool_steals_oldest_when_all_sustaining() {
        let (mut pool, ids) = full_pool(4);
        for &id in &ids {
            pool.get_mut(id).unwrap().state = VoiceState::Sustaining;
        }
        let id = pool.allocate().unwrap();
        assert_eq!(id.index(), ids[0].index());
        assert!(pool.get(ids[0]).is_none());
        assert_eq!(pool.active_count(), 4);
    }

    #[test]
    fn pool_steal_fading_first() {
        let (mut pool, ids) = full_pool(8);
        for &id in &ids {
            pool.get_mut(id).unwrap().state = VoiceState::Sustaining;
        }
        pool.get_mut(ids[3]).unwrap().state = VoiceState::Releasing;
        pool.get_mut(ids[5]).unwrap().state = VoiceState::FadingOut;
        let id = pool.allocate().unwrap();
        assert_eq!(id.index(), ids[5].index());
    }

    #[test]
    fn pool_steal_released_second() {
        let (mut pool, ids) = full_pool(8);
        for &id in &ids {
            pool.get_mut(id).unwrap().state = VoiceState::Sustaining;
        }
        pool.get_mut(ids[6]).unwrap().state = VoiceState::Releasing;
        let id = pool.allocate().unwrap();
        assert_eq!(id.index(), ids[6].index());
    }

    #[test]
    fn pool_new_voice_is_youngest() {
        let (mut pool, ids) = full_pool(3);
        let id = pool.allocate().unwrap();
        assert_eq!(pool.ids(), &[ids[1], ids[2], id]);
    }

    #[test]
    fn pool_clear_empties() {
        let (mut pool, ids) = full_pool(3);
        pool.clear();
        assert_eq!(pool.active_count(), 0);
        assert!(pool.get(ids[0]).is_none());
        assert!(pool.allocate().is_some());
    }
}
