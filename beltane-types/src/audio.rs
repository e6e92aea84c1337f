//! The per-block audio buffer abstraction.
//!
//! The physical device backend is out of scope; the scheduler only sees an
//! interleaved-free block with per-channel accessors. Callers must not
//! retain references across render calls.

/// A planar audio block: `channels` runs of `frames` samples each.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    channels: usize,
    frames: usize,
    data: Vec<f32>,
}

impl AudioBlock {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels,
            frames,
            data: vec![0.0; channels * frames],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.frames;
        &self.data[start..start + self.frames]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Zero every sample. Scratch blocks are cleared before each render pass.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Add `other` into this block sample-by-sample, scaled per channel.
    /// Shapes may differ (device backends deliver variable block sizes);
    /// only the overlapping channels and frames are touched.
    pub fn mix_scaled(&mut self, other: &AudioBlock, gains: &[f32]) {
        let channels = self.channels.min(other.channels);
        let frames = self.frames.min(other.frames);
        for ch in 0..channels {
            let gain = gains.get(ch).copied().unwrap_or(1.0);
            let dst = ch * self.frames;
            let src = ch * other.frames;
            for i in 0..frames {
                self.data[dst + i] += other.data[src + i] * gain;
            }
        }
    }

    /// Add `other` into this block unscaled.
    pub fn mix(&mut self, other: &AudioBlock) {
        self.mix_scaled(other, &[]);
    }

    /// Copy `other` over this block, zero-filling anything outside the
    /// overlap.
    pub fn copy_from(&mut self, other: &AudioBlock) {
        self.clear();
        self.mix(other);
    }
}
