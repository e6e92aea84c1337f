//! # beltane-scene
//!
//! The scene scheduler: per-voice audio rendering with sample-accurate
//! start/stop offsets, spatialization composition, a configurable time
//! master (exactly one of the audio/graphics/update contexts advances the
//! logical clock), and optional parallel rendering. Also hosts the domain
//! orchestration tree.

mod domain;
mod scheduler;
mod spatializer;

pub use domain::{DomainHandler, DomainId, DomainKind, DomainRegistry, TickOrder};
pub use scheduler::{SceneHook, SceneScheduler};
pub use spatializer::Spatializer;
