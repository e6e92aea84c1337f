//! The scene scheduler.
//!
//! Three periodic contexts drive a shared voice registry. Exactly one of
//! them (the time master) merges and sweeps; the other two only read. The
//! audio path uses non-blocking snapshots with stale-snapshot reuse so it
//! never waits on the master's reconciliation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::debug;

use beltane_types::{AudioBlock, ParamValue, Pose, SceneConfig, TimeMasterMode, TriggerParam, VoiceId, VoiceState};
use beltane_voice::{DrawContext, ThreadPool, Voice, VoiceHandle, VoiceRegistry};

use crate::spatializer::Spatializer;

/// Lifecycle observer, installed by the replication layer on the Primary.
/// Local mutation and replicated mutation share one code path; the hook is
/// the only seam between them.
pub trait SceneHook: Send {
    fn on_trigger_on(
        &mut self,
        id: VoiceId,
        start_offset: u32,
        voice_type: &str,
        params: &[TriggerParam],
    );
    fn on_trigger_off(&mut self, id: VoiceId);
    fn on_remove(&mut self, id: VoiceId);
    fn on_all_off(&mut self);
    fn on_param(&mut self, id: VoiceId, addr: &str, value: &ParamValue);
}

struct RenderJob {
    refs: Vec<(VoiceHandle, VoiceId)>,
    frames: usize,
}

/// Dedicated audio render workers. Distinct from the shared `ThreadPool`:
/// the audio thread hands each worker its partition for the current block
/// and collects completions, so no work is ever enqueued onto the general
/// pool from the audio path.
struct RenderWorkers {
    job_txs: Vec<Sender<RenderJob>>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl RenderWorkers {
    fn spawn(
        count: usize,
        registry: Arc<VoiceRegistry>,
        spatializer: Arc<Mutex<Spatializer>>,
        channels: usize,
        frames: usize,
    ) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
        let mut job_txs = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let (tx, rx) = crossbeam_channel::bounded::<RenderJob>(1);
            let registry = registry.clone();
            let spatializer = spatializer.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("render-worker-{}", i))
                .spawn(move || {
                    // Private scratch block avoids false sharing; only the
                    // final merge touches shared state.
                    let mut scratch = AudioBlock::new(channels, frames);
                    while let Ok(job) = rx.recv() {
                        if scratch.frames() != job.frames {
                            scratch = AudioBlock::new(channels, job.frames);
                        }
                        for (handle, _) in &job.refs {
                            scratch.clear();
                            if let Some(pose) = render_voice_into(&registry, *handle, &mut scratch)
                            {
                                if let Ok(mut sp) = spatializer.lock() {
                                    sp.merge(pose, &scratch);
                                }
                            }
                        }
                        let _ = done_tx.send(());
                    }
                })
                .expect("failed to spawn render worker");
            job_txs.push(tx);
            handles.push(handle);
        }

        Self {
            job_txs,
            done_rx,
            handles,
        }
    }
}

impl Drop for RenderWorkers {
    fn drop(&mut self) {
        self.job_txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub struct SceneScheduler {
    registry: Arc<VoiceRegistry>,
    config: SceneConfig,
    spatializer: Arc<Mutex<Spatializer>>,
    workers: Option<RenderWorkers>,
    pool: Option<Arc<ThreadPool>>,
    /// Prevents the graphics iteration from tearing if two graphics callers
    /// overlap; distinct from every audio-path lock.
    graphics_gate: Mutex<()>,
    hook: Mutex<Option<Box<dyn SceneHook>>>,
    /// Last good active snapshot, reused when the active lock is busy
    /// during an audio render (bounded one-cycle staleness).
    last_audio_snapshot: Mutex<Vec<(VoiceHandle, VoiceId)>>,
    /// Remove events observed while the hook mutex was busy, carried to a
    /// later tick. Only the master context touches this.
    pending_removes: Mutex<Vec<VoiceId>>,
    serial_scratch: Mutex<AudioBlock>,
    cycle: AtomicU64,
}

impl SceneScheduler {
    pub fn new(config: SceneConfig) -> Self {
        let registry = Arc::new(VoiceRegistry::new(config.max_voices));
        let spatializer = Arc::new(Mutex::new(Spatializer::new(
            config.channels,
            config.block_frames,
        )));

        let workers = if config.audio_workers > 0 {
            Some(RenderWorkers::spawn(
                config.audio_workers,
                registry.clone(),
                spatializer.clone(),
                config.channels,
                config.block_frames,
            ))
        } else {
            None
        };

        let pool = if config.parallel_update {
            let n = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
            Some(Arc::new(ThreadPool::new(n)))
        } else {
            None
        };

        let serial_scratch = Mutex::new(AudioBlock::new(config.channels, config.block_frames));

        Self {
            registry,
            config,
            spatializer,
            workers,
            pool,
            graphics_gate: Mutex::new(()),
            hook: Mutex::new(None),
            last_audio_snapshot: Mutex::new(Vec::new()),
            pending_removes: Mutex::new(Vec::new()),
            serial_scratch,
            cycle: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<VoiceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    /// Install the lifecycle hook. Called once at startup on the Primary;
    /// Replicas install nothing.
    pub fn set_hook(&self, hook: Box<dyn SceneHook>) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = Some(hook);
        }
    }

    /// Queue a voice for activation and fan the event out through the hook.
    /// `id` is `None` locally; the replica apply path passes the Primary's
    /// id verbatim.
    pub fn trigger_on(
        &self,
        voice: Box<dyn Voice>,
        start_offset: u32,
        id: Option<VoiceId>,
    ) -> Option<VoiceId> {
        let voice_type = voice.type_name();
        let params = voice.trigger_params();
        let id = self.registry.trigger_on(voice, start_offset, id)?;
        self.emit(|h| h.on_trigger_on(id, start_offset, voice_type, &params));
        Some(id)
    }

    pub fn trigger_off(&self, id: VoiceId) {
        self.registry.trigger_off(id);
        self.emit(|h| h.on_trigger_off(id));
    }

    pub fn all_off(&self) {
        self.registry.all_off();
        self.emit(|h| h.on_all_off());
    }

    /// Set a live voice's parameter and replicate the change.
    pub fn set_param(&self, id: VoiceId, addr: &str, value: &ParamValue) -> bool {
        let ok = self.set_param_direct(id, addr, value);
        if ok {
            self.emit(|h| h.on_param(id, addr, value));
        }
        ok
    }

    /// Set a parameter without re-emitting through the hook. Used when the
    /// change arrived over the wire, to prevent feedback loops.
    pub fn set_param_direct(&self, id: VoiceId, addr: &str, value: &ParamValue) -> bool {
        let Some(handle) = self.registry.find_active(id) else {
            debug!("set_param: voice {} not active, ignoring", id);
            return false;
        };
        self.registry
            .with_voice(handle, |cell| {
                cell.voice
                    .as_mut()
                    .map(|v| v.set_param(addr, value))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Audio callback entry point. Never blocks on a held reconciliation
    /// lock; skipped work is deferred one cycle.
    pub fn render_audio(&self, out: &mut AudioBlock) {
        if self.config.time_master == TimeMasterMode::Audio {
            self.master_tick();
        }

        let snapshot = self.audio_snapshot();

        match &self.workers {
            Some(workers) => {
                // Round-robin partition, recomputed once per cycle since
                // membership is stable for the duration of the pass.
                let n = workers.job_txs.len();
                let mut parts: Vec<Vec<(VoiceHandle, VoiceId)>> = vec![Vec::new(); n];
                for (i, item) in snapshot.iter().enumerate() {
                    parts[i % n].push(*item);
                }
                let mut sent = 0;
                for (tx, refs) in workers.job_txs.iter().zip(parts) {
                    let job = RenderJob {
                        refs,
                        frames: out.frames(),
                    };
                    if tx.try_send(job).is_ok() {
                        sent += 1;
                    }
                }
                for _ in 0..sent {
                    let _ = workers.done_rx.recv();
                }
            }
            None => {
                if let Ok(mut scratch) = self.serial_scratch.try_lock() {
                    if scratch.frames() != out.frames() {
                        *scratch = AudioBlock::new(out.channels(), out.frames());
                    }
                    for &(handle, _) in &snapshot {
                        scratch.clear();
                        if let Some(pose) = render_voice_into(&self.registry, handle, &mut scratch)
                        {
                            if let Ok(mut sp) = self.spatializer.lock() {
                                sp.merge(pose, &scratch);
                            }
                        }
                    }
                }
            }
        }

        if let Ok(mut sp) = self.spatializer.lock() {
            sp.drain_into(out);
        } else {
            out.clear();
        }
    }

    /// Graphics callback entry point. May block; runs under its own gate so
    /// overlapping graphics callers serialize against each other only.
    pub fn render_graphics(&self, ctx: &mut dyn DrawContext) {
        if self.config.time_master == TimeMasterMode::Graphics {
            self.master_tick();
        }

        let _gate = self.graphics_gate.lock();
        for (handle, _) in self.registry.active_handles() {
            self.registry.with_voice(handle, |cell| {
                if cell.state != VoiceState::Active {
                    return;
                }
                let pose = cell.voice.as_ref().and_then(|v| v.pose());
                if let Some(p) = &pose {
                    ctx.push_transform(&p.transform());
                }
                if let Some(v) = cell.voice.as_mut() {
                    v.render_graphics(ctx);
                }
                if pose.is_some() {
                    ctx.pop_transform();
                }
            });
        }
    }

    /// Update/simulation entry point. A pool barrier is acceptable here
    /// because update is not a hard real-time path.
    pub fn update(&self, dt: f32) {
        if self.config.time_master == TimeMasterMode::Update {
            self.master_tick();
        }

        let snapshot = self.registry.active_handles();
        match &self.pool {
            Some(pool) if self.config.parallel_update => {
                for &(handle, _) in &snapshot {
                    let registry = self.registry.clone();
                    pool.execute(move || {
                        registry.with_voice(handle, |cell| {
                            if let Some(v) = cell.voice.as_mut() {
                                v.update(dt);
                            }
                        });
                    });
                }
                pool.wait_finished();
            }
            _ => {
                for &(handle, _) in &snapshot {
                    self.registry.with_voice(handle, |cell| {
                        if let Some(v) = cell.voice.as_mut() {
                            v.update(dt);
                        }
                    });
                }
            }
        }
    }

    /// Advance the logical clock: merge, sweep, and report reclaimed voices
    /// through the hook. Only the master context reaches this.
    fn master_tick(&self) {
        let before = self.registry.try_active_handles();
        self.registry.merge_and_sweep();
        // Diff the active set to observe Active -> Free transitions. Both
        // snapshots are non-blocking; if either lock is busy the remove
        // events for this cycle are not observed (best-effort, like the
        // rest of the protocol).
        let mut removed: Vec<VoiceId> = Vec::new();
        if let Ok(mut carried) = self.pending_removes.try_lock() {
            removed.append(&mut carried);
        }
        if let (Some(before), Some(after)) = (before, self.registry.try_active_handles()) {
            let after_ids: HashSet<VoiceId> = after.iter().map(|&(_, id)| id).collect();
            for (_, id) in before {
                if !after_ids.contains(&id) {
                    removed.push(id);
                }
            }
        }
        // The master may be the audio context, so the hook mutex is only
        // ever tried here; busy means the removes carry to a later tick.
        if !removed.is_empty() {
            match self.hook.try_lock() {
                Ok(mut hook) => {
                    if let Some(h) = hook.as_mut() {
                        for id in removed {
                            h.on_remove(id);
                        }
                    }
                }
                Err(_) => {
                    if let Ok(mut carried) = self.pending_removes.try_lock() {
                        carried.append(&mut removed);
                    }
                }
            }
        }
        self.cycle.fetch_add(1, Ordering::Relaxed);
    }

    fn audio_snapshot(&self) -> Vec<(VoiceHandle, VoiceId)> {
        match self.registry.try_active_handles() {
            Some(fresh) => {
                if let Ok(mut last) = self.last_audio_snapshot.try_lock() {
                    *last = fresh.clone();
                }
                fresh
            }
            None => self
                .last_audio_snapshot
                .try_lock()
                .map(|l| l.clone())
                .unwrap_or_default(),
        }
    }

    fn emit(&self, f: impl FnOnce(&mut dyn SceneHook)) {
        if let Ok(mut hook) = self.hook.lock() {
            if let Some(h) = hook.as_mut() {
                f(h.as_mut());
            }
        }
    }
}

/// Render one voice into `scratch`, honoring its start/end offsets:
/// silence before the start offset, truncation at the end offset, both
/// consumed after their first block. Returns the voice's pose on success,
/// `None` when the slot was busy or no longer active (deferred, not an
/// error).
fn render_voice_into(
    registry: &VoiceRegistry,
    handle: VoiceHandle,
    scratch: &mut AudioBlock,
) -> Option<Option<Pose>> {
    let rendered = registry.try_with_voice(handle, |cell| {
        if cell.state != VoiceState::Active {
            return None;
        }
        let frames = scratch.frames();
        let from = (cell.start_offset as usize).min(frames);
        let to = cell
            .end_offset
            .map(|e| (e as usize).min(frames))
            .unwrap_or(frames);
        let pose = cell.voice.as_ref().and_then(|v| v.pose());
        if let Some(v) = cell.voice.as_mut() {
            if from < to {
                v.render_audio(scratch, from, to);
            }
        }
        cell.start_offset = 0;
        if cell.end_offset.take().is_some() {
            if let Some(v) = cell.voice.as_mut() {
                v.release();
            }
        }
        Some(pose)
    });
    rendered.flatten()
}
