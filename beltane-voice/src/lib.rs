//! # beltane-voice
//!
//! The voice-list concurrency engine: a generation-checked slot arena with
//! active/pending/free index sets, a bounded SPSC turn-off ring, and a
//! bounded worker thread pool.
//!
//! The central invariant: nothing on the audio-rendering path ever blocks
//! on a held lock. Reconciliation uses non-blocking attempts and defers to
//! the next cycle on failure.

mod pool;
mod registry;
mod voice;

pub use pool::ThreadPool;
pub use registry::{VoiceCell, VoiceHandle, VoiceRegistry};
pub use voice::{DrawContext, Voice};
