//! Spatialization composition.
//!
//! Owns the shared mix bus. Workers render each voice into a private
//! scratch block, then merge it here under one mutex; the mutex is held
//! only for the merge, never during per-voice DSP.

use beltane_types::{AudioBlock, Pose};

pub struct Spatializer {
    mix: AudioBlock,
    master_gain: f32,
}

impl Spatializer {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            mix: AudioBlock::new(channels, frames),
            master_gain: 1.0,
        }
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    /// Per-channel gains for a voice at `pose`. Non-positioned voices pass
    /// through at unity. Stereo uses constant-power panning from the x/z
    /// azimuth plus inverse-distance attenuation; other channel counts get
    /// attenuation only.
    pub fn gains(&self, pose: Option<Pose>, channels: usize) -> Vec<f32> {
        let Some(pose) = pose else {
            return vec![1.0; channels];
        };
        let dist = pose.distance();
        let atten = 1.0 / (1.0 + dist);
        if channels != 2 {
            return vec![atten; channels];
        }
        let [x, _, z] = pose.position;
        let azimuth = x.atan2(z.max(1e-6));
        // Map [-pi/2, pi/2] to a pan angle in [0, pi/2].
        let pan = (azimuth.clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2)
            / std::f32::consts::PI
            + 0.5)
            * std::f32::consts::FRAC_PI_2;
        vec![pan.cos() * atten, pan.sin() * atten]
    }

    /// Merge a rendered voice block into the mix bus. The bus adopts the
    /// scratch block's shape when it differs, so a backend switching block
    /// sizes mid-stream reshapes the bus instead of clipping against it.
    pub fn merge(&mut self, pose: Option<Pose>, scratch: &AudioBlock) {
        if self.mix.channels() != scratch.channels() || self.mix.frames() != scratch.frames() {
            self.mix = AudioBlock::new(scratch.channels(), scratch.frames());
        }
        let gains = self.gains(pose, self.mix.channels());
        self.mix.mix_scaled(scratch, &gains);
    }

    /// Copy the mix into `out` with the master gain applied, then clear the
    /// bus for the next cycle.
    pub fn drain_into(&mut self, out: &mut AudioBlock) {
        out.clear();
        let gains = vec![self.master_gain; out.channels()];
        out.mix_scaled(&self.mix, &gains);
        self.mix.clear();
    }

    pub fn frames(&self) -> usize {
        self.mix.frames()
    }
}
