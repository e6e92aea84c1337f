//! The polymorphic voice trait and the draw-context seam.

use beltane_types::{AudioBlock, Mat4, ParamValue, Pose, TriggerParam};

/// Opaque graphics draw context. The core only issues transform calls;
/// drawing any given voice's visuals is delegated to the voice's own hook.
pub trait DrawContext {
    fn push_transform(&mut self, m: &Mat4);
    fn pop_transform(&mut self);
}

/// A unit of concurrent work with its own lifecycle: sound and/or graphics
/// generator, triggered on and off from arbitrary threads, rendered from
/// the audio/graphics/update callbacks.
///
/// Implementations must be cheap to render: per-voice hooks run inside the
/// periodic callbacks, and the audio hook runs on the real-time path.
pub trait Voice: Send {
    /// Stable type name, carried in `triggerOn` replication messages so a
    /// Replica can acquire a voice of the same concrete type.
    fn type_name(&self) -> &'static str;

    /// Snapshot of the trigger parameters in declaration order. Encoded as
    /// the trailing arguments of a `triggerOn` message.
    fn trigger_params(&self) -> Vec<TriggerParam>;

    /// Set a registered parameter by address. Returns false for unknown
    /// addresses (logged and dropped by the caller).
    fn set_param(&mut self, addr: &str, value: &ParamValue) -> bool;

    /// Cooperative stop request. The voice decides when `is_done` becomes
    /// true (e.g. after its release envelope finishes).
    fn release(&mut self);

    /// Reclaim predicate, checked once per sweep.
    fn is_done(&self) -> bool;

    /// Render frames `[from, to)` of `block`. Frames outside the range are
    /// the scheduler's responsibility (start/stop offsets).
    fn render_audio(&mut self, block: &mut AudioBlock, from: usize, to: usize);

    /// Graphics hook, called with the voice's pose transform already
    /// pushed.
    fn render_graphics(&mut self, _ctx: &mut dyn DrawContext) {}

    /// Simulation step.
    fn update(&mut self, _dt: f32) {}

    /// Spatial attributes when this is a positioned voice.
    fn pose(&self) -> Option<Pose> {
        None
    }
}
