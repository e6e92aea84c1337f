//! Voice registry: slot arena, index sets, and the turn-off ring.
//!
//! Voices live in a fixed arena of generation-checked slots. The three
//! index sets (`active`, `pending`, `free_slots`) are each guarded by their
//! own mutex; structural membership changes happen only inside
//! `merge_and_sweep`, which acquires every lock with a non-blocking attempt
//! and defers to the next cycle when one is busy. Readers snapshot the
//! active set and then visit voices through per-slot locks, so a reclaimed
//! slot can never be dereferenced through a stale handle (the generation
//! check fails instead).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use beltane_types::{VoiceId, VoiceState};

use crate::voice::Voice;

/// Generation-checked reference to an arena slot. Stale handles (slot
/// reclaimed and reused since the handle was taken) resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Mutable voice payload of one slot, accessed under the slot lock.
pub struct VoiceCell {
    pub state: VoiceState,
    pub id: VoiceId,
    /// First frame of the next render block this voice sounds on.
    /// Consumed (reset to 0) by the scheduler after one block.
    pub start_offset: u32,
    /// Frame within the next render block to truncate at, if any.
    pub end_offset: Option<u32>,
    pub voice: Option<Box<dyn Voice>>,
}

impl VoiceCell {
    fn empty() -> Self {
        Self {
            state: VoiceState::Free,
            id: VoiceId::new(0),
            start_offset: 0,
            end_offset: None,
            voice: None,
        }
    }
}

struct Slot {
    generation: AtomicU32,
    cell: Mutex<VoiceCell>,
}

/// The voice registry. Safe to share across the audio, graphics, update,
/// and network threads; every operation takes `&self`.
pub struct VoiceRegistry {
    slots: Box<[Slot]>,
    /// Slot indices currently unused.
    free_slots: Mutex<Vec<u32>>,
    /// Slot indices awaiting promotion, newest first, paired with their id.
    pending: Mutex<Vec<(u32, VoiceId)>>,
    /// Slot indices of active voices, paired with their id.
    active: Mutex<Vec<(u32, VoiceId)>>,
    /// Reclaimed voice objects pooled per concrete type, keyed by
    /// `Voice::type_name`.
    free_pool: Mutex<HashMap<&'static str, Vec<Box<dyn Voice>>>>,
    turnoff_tx: Mutex<rtrb::Producer<u64>>,
    turnoff_rx: Mutex<rtrb::Consumer<u64>>,
    /// Turn-off ids whose slot lock was busy during the last drain; retried
    /// next cycle. Only the master context touches this.
    carried_off: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    skipped_merges: AtomicU64,
    skipped_sweeps: AtomicU64,
    dropped_turnoffs: AtomicU64,
}

impl VoiceRegistry {
    pub fn new(max_voices: usize) -> Self {
        let slots: Vec<Slot> = (0..max_voices)
            .map(|_| Slot {
                generation: AtomicU32::new(0),
                cell: Mutex::new(VoiceCell::empty()),
            })
            .collect();
        let (turnoff_tx, turnoff_rx) = rtrb::RingBuffer::new(max_voices.max(16));

        Self {
            slots: slots.into_boxed_slice(),
            free_slots: Mutex::new((0..max_voices as u32).rev().collect()),
            pending: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            free_pool: Mutex::new(HashMap::new()),
            turnoff_tx: Mutex::new(turnoff_tx),
            turnoff_rx: Mutex::new(turnoff_rx),
            carried_off: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            skipped_merges: AtomicU64::new(0),
            skipped_sweeps: AtomicU64::new(0),
            dropped_turnoffs: AtomicU64::new(0),
        }
    }

    /// Queue a voice for activation. Returns the assigned id immediately;
    /// the voice becomes active at the master context's next merge.
    ///
    /// `id` is `None` for locally originated triggers (monotonic counter)
    /// and `Some` when a Replica replays the Primary's id verbatim.
    pub fn trigger_on(
        &self,
        voice: Box<dyn Voice>,
        start_offset: u32,
        id: Option<VoiceId>,
    ) -> Option<VoiceId> {
        let slot_idx = match self.free_slots.lock() {
            Ok(mut free) => free.pop(),
            Err(_) => None,
        };
        let Some(slot_idx) = slot_idx else {
            warn!("trigger_on: voice capacity exhausted, dropping trigger");
            return None;
        };

        let id = id.unwrap_or_else(|| VoiceId::new(self.next_id.fetch_add(1, Ordering::Relaxed)));

        // Fresh from the free list, so this lock is uncontended.
        if let Ok(mut cell) = self.slots[slot_idx as usize].cell.lock() {
            cell.state = VoiceState::PendingInsert;
            cell.id = id;
            cell.start_offset = start_offset;
            cell.end_offset = None;
            cell.voice = Some(voice);
        }

        if let Ok(mut pending) = self.pending.lock() {
            pending.push((slot_idx, id));
        }

        Some(id)
    }

    /// Queue a cooperative stop for `id`. Lock-free; if the ring is full
    /// the request is dropped (documented loss, not fatal).
    pub fn trigger_off(&self, id: VoiceId) {
        let pushed = match self.turnoff_tx.lock() {
            Ok(mut tx) => tx.push(id.get()).is_ok(),
            Err(_) => false,
        };
        if !pushed {
            self.dropped_turnoffs.fetch_add(1, Ordering::Relaxed);
            warn!("trigger_off: turn-off ring full, dropping request for voice {}", id);
        }
    }

    /// Set the truncation frame for `id`'s next render block, for
    /// sample-accurate stops.
    pub fn set_end_offset(&self, id: VoiceId, frames: u32) {
        if let Some(handle) = self.find_active(id) {
            self.with_voice(handle, |cell| cell.end_offset = Some(frames));
        }
    }

    /// Merge pending voices, drain turn-off requests, and reclaim finished
    /// voices. Called exactly once per cycle, only by the master-clock
    /// context. Every lock here is a non-blocking attempt; a busy lock
    /// defers that stage to the next cycle and bumps the matching counter.
    pub fn merge_and_sweep(&self) {
        self.merge_pending();

        let mut off_ids: Vec<u64> = Vec::new();
        if let Ok(mut carried) = self.carried_off.try_lock() {
            off_ids.append(&mut carried);
        }
        if let Ok(mut rx) = self.turnoff_rx.try_lock() {
            while let Ok(id) = rx.pop() {
                off_ids.push(id);
            }
        }

        self.sweep(off_ids);
    }

    fn merge_pending(&self) {
        let Ok(mut pending) = self.pending.try_lock() else {
            self.skipped_merges.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if pending.is_empty() {
            return;
        }
        let Ok(mut active) = self.active.try_lock() else {
            self.skipped_merges.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut kept = Vec::new();
        for (slot_idx, id) in pending.drain(..) {
            match self.slots[slot_idx as usize].cell.try_lock() {
                Ok(mut cell) => {
                    cell.state = VoiceState::Active;
                    active.push((slot_idx, id));
                }
                Err(_) => kept.push((slot_idx, id)),
            }
        }
        *pending = kept;
    }

    fn sweep(&self, off_ids: Vec<u64>) {
        let Ok(mut active) = self.active.try_lock() else {
            self.defer_turnoffs(off_ids);
            self.skipped_sweeps.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(mut free) = self.free_slots.try_lock() else {
            self.defer_turnoffs(off_ids);
            self.skipped_sweeps.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(mut pool) = self.free_pool.try_lock() else {
            self.defer_turnoffs(off_ids);
            self.skipped_sweeps.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Cooperative-off pass: call release() on each requested voice.
        // Unknown ids are no-ops (idempotent apply); busy slots are retried
        // next cycle.
        let mut carry = Vec::new();
        for id in off_ids {
            let Some(&(slot_idx, _)) = active.iter().find(|(_, vid)| vid.get() == id) else {
                debug!("trigger_off: voice {} not active, ignoring", id);
                continue;
            };
            match self.slots[slot_idx as usize].cell.try_lock() {
                Ok(mut cell) => {
                    if let Some(voice) = cell.voice.as_mut() {
                        voice.release();
                    }
                }
                Err(_) => carry.push(id),
            }
        }
        if !carry.is_empty() {
            self.defer_turnoffs(carry);
        }

        // Structural removal pass: detach every done voice, bump its slot
        // generation, and return the object to the per-type pool.
        let mut retained = Vec::with_capacity(active.len());
        for (slot_idx, id) in active.drain(..) {
            let slot = &self.slots[slot_idx as usize];
            let reclaimed = match slot.cell.try_lock() {
                Ok(mut cell) => {
                    let done = cell.voice.as_ref().map(|v| v.is_done()).unwrap_or(true);
                    if done {
                        if let Some(voice) = cell.voice.take() {
                            pool.entry(voice.type_name()).or_default().push(voice);
                        }
                        *cell = VoiceCell::empty();
                        slot.generation.fetch_add(1, Ordering::Release);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            };
            if reclaimed {
                free.push(slot_idx);
            } else {
                retained.push((slot_idx, id));
            }
        }
        *active = retained;
    }

    fn defer_turnoffs(&self, mut ids: Vec<u64>) {
        if ids.is_empty() {
            return;
        }
        if let Ok(mut carried) = self.carried_off.try_lock() {
            carried.append(&mut ids);
        }
    }

    /// Release every active voice. Reclaim happens at the following sweeps
    /// as each voice reports done.
    pub fn all_off(&self) {
        let snapshot = self.active_handles();
        for (handle, _) in snapshot {
            self.with_voice(handle, |cell| {
                if let Some(voice) = cell.voice.as_mut() {
                    voice.release();
                }
            });
        }
    }

    /// Pop a pooled voice of the named concrete type. `None` means the
    /// pool for that type is exhausted; the caller decides whether that is
    /// worth logging (on a Replica it causes accepted divergence).
    pub fn acquire_free_voice(&self, type_name: &str) -> Option<Box<dyn Voice>> {
        let mut pool = self.free_pool.lock().ok()?;
        pool.get_mut(type_name).and_then(|v| v.pop())
    }

    /// Return a voice object to the per-type pool. Used to seed the pool at
    /// startup and by external owners handing voices back.
    pub fn release_voice(&self, voice: Box<dyn Voice>) {
        if let Ok(mut pool) = self.free_pool.lock() {
            pool.entry(voice.type_name()).or_default().push(voice);
        }
    }

    /// Snapshot of the active set. May block briefly on the active mutex;
    /// safe from the graphics/update paths.
    pub fn active_handles(&self) -> Vec<(VoiceHandle, VoiceId)> {
        match self.active.lock() {
            Ok(active) => active.iter().map(|&(s, id)| (self.handle(s), id)).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Non-blocking snapshot of the active set, for the audio path.
    /// `None` means the active lock was busy; the caller reuses its
    /// previous snapshot (bounded one-cycle staleness).
    pub fn try_active_handles(&self) -> Option<Vec<(VoiceHandle, VoiceId)>> {
        match self.active.try_lock() {
            Ok(active) => Some(active.iter().map(|&(s, id)| (self.handle(s), id)).collect()),
            Err(_) => None,
        }
    }

    fn handle(&self, slot: u32) -> VoiceHandle {
        VoiceHandle {
            slot,
            generation: self.slots[slot as usize].generation.load(Ordering::Acquire),
        }
    }

    /// Run `f` on the voice cell behind `handle`, blocking on the slot
    /// lock. Returns `None` when the handle is stale or the slot is free.
    pub fn with_voice<R>(&self, handle: VoiceHandle, f: impl FnOnce(&mut VoiceCell) -> R) -> Option<R> {
        let slot = self.slots.get(handle.slot as usize)?;
        let mut cell = slot.cell.lock().ok()?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        if cell.voice.is_none() {
            return None;
        }
        Some(f(&mut cell))
    }

    /// Non-blocking variant of [`with_voice`](Self::with_voice) for the
    /// audio path. `None` also covers a busy slot lock (deferral).
    pub fn try_with_voice<R>(
        &self,
        handle: VoiceHandle,
        f: impl FnOnce(&mut VoiceCell) -> R,
    ) -> Option<R> {
        let slot = self.slots.get(handle.slot as usize)?;
        let mut cell = slot.cell.try_lock().ok()?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        if cell.voice.is_none() {
            return None;
        }
        Some(f(&mut cell))
    }

    /// Look up the active voice with the given id.
    pub fn find_active(&self, id: VoiceId) -> Option<VoiceHandle> {
        match self.active.lock() {
            Ok(active) => active
                .iter()
                .find(|&&(_, vid)| vid == id)
                .map(|&(s, _)| self.handle(s)),
            Err(_) => None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Merges skipped because a list lock was busy. Deferral is observable
    /// so latency bounds can be tested.
    pub fn skipped_merges(&self) -> u64 {
        self.skipped_merges.load(Ordering::Relaxed)
    }

    pub fn skipped_sweeps(&self) -> u64 {
        self.skipped_sweeps.load(Ordering::Relaxed)
    }

    pub fn dropped_turnoffs(&self) -> u64 {
        self.dropped_turnoffs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltane_types::{AudioBlock, ParamValue, TriggerParam};

    struct TestVoice {
        freq: f32,
        released: bool,
    }

    impl TestVoice {
        fn boxed(freq: f32) -> Box<dyn Voice> {
            Box::new(TestVoice {
                freq,
                released: false,
            })
        }
    }

    impl Voice for TestVoice {
        fn type_name(&self) -> &'static str {
            "Test"
        }
        fn trigger_params(&self) -> Vec<TriggerParam> {
            vec![TriggerParam::new("freq", self.freq)]
        }
        fn set_param(&mut self, addr: &str, value: &ParamValue) -> bool {
            if addr == "freq" {
                self.freq = value.to_f32();
                true
            } else {
                false
            }
        }
        fn release(&mut self) {
            self.released = true;
        }
        fn is_done(&self) -> bool {
            self.released
        }
        fn render_audio(&mut self, block: &mut AudioBlock, from: usize, to: usize) {
            for ch in 0..block.channels() {
                for s in &mut block.channel_mut(ch)[from..to] {
                    *s += 1.0;
                }
            }
        }
    }

    #[test]
    fn trigger_on_assigns_monotonic_ids() {
        let reg = VoiceRegistry::new(8);
        let a = reg.trigger_on(TestVoice::boxed(440.0), 0, None).unwrap();
        let b = reg.trigger_on(TestVoice::boxed(220.0), 0, None).unwrap();
        assert!(b > a);
        assert_eq!(reg.pending_count(), 2);
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn trigger_on_uses_caller_id_verbatim() {
        let reg = VoiceRegistry::new(8);
        let id = reg
            .trigger_on(TestVoice::boxed(440.0), 0, Some(VoiceId::new(7)))
            .unwrap();
        assert_eq!(id, VoiceId::new(7));
        reg.merge_and_sweep();
        assert!(reg.find_active(VoiceId::new(7)).is_some());
    }

    #[test]
    fn merge_promotes_exactly_once() {
        let reg = VoiceRegistry::new(8);
        reg.trigger_on(TestVoice::boxed(440.0), 0, None).unwrap();
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.pending_count(), 0);
        // A second merge with nothing pending changes nothing.
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn trigger_off_then_sweep_reclaims_to_pool() {
        let reg = VoiceRegistry::new(8);
        let id = reg.trigger_on(TestVoice::boxed(440.0), 0, None).unwrap();
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 1);

        reg.trigger_off(id);
        // First pass releases, second pass observes done and reclaims.
        reg.merge_and_sweep();
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 0);
        assert_eq!(reg.free_slot_count(), 8);
        assert!(reg.acquire_free_voice("Test").is_some());
    }

    #[test]
    fn trigger_off_unknown_id_is_noop() {
        let reg = VoiceRegistry::new(8);
        reg.trigger_on(TestVoice::boxed(440.0), 0, None).unwrap();
        reg.merge_and_sweep();
        reg.trigger_off(VoiceId::new(9999));
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn capacity_exhaustion_returns_none() {
        let reg = VoiceRegistry::new(2);
        assert!(reg.trigger_on(TestVoice::boxed(1.0), 0, None).is_some());
        assert!(reg.trigger_on(TestVoice::boxed(2.0), 0, None).is_some());
        assert!(reg.trigger_on(TestVoice::boxed(3.0), 0, None).is_none());
    }

    #[test]
    fn stale_handle_resolves_to_nothing() {
        let reg = VoiceRegistry::new(4);
        let id = reg.trigger_on(TestVoice::boxed(440.0), 0, None).unwrap();
        reg.merge_and_sweep();
        let handle = reg.find_active(id).unwrap();

        reg.trigger_off(id);
        reg.merge_and_sweep();
        reg.merge_and_sweep();

        assert!(reg.with_voice(handle, |_| ()).is_none());
    }

    #[test]
    fn all_off_releases_every_voice() {
        let reg = VoiceRegistry::new(8);
        for i in 0..4 {
            reg.trigger_on(TestVoice::boxed(i as f32), 0, None).unwrap();
        }
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 4);
        reg.all_off();
        reg.merge_and_sweep();
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn acquire_free_voice_by_type() {
        let reg = VoiceRegistry::new(8);
        reg.release_voice(TestVoice::boxed(440.0));
        assert!(reg.acquire_free_voice("Test").is_some());
        assert!(reg.acquire_free_voice("Test").is_none());
        assert!(reg.acquire_free_voice("Unknown").is_none());
    }

    #[test]
    fn ring_overflow_drops_and_counts() {
        let reg = VoiceRegistry::new(2);
        // Ring capacity is max(2, 16) = 16; push until something drops.
        for i in 0..40 {
            reg.trigger_off(VoiceId::new(i));
        }
        assert!(reg.dropped_turnoffs() > 0);
    }
}
