//! # beltane-types
//!
//! Shared type definitions for the Beltane voice-scheduling core.
//! This crate contains plain data used across beltane-voice, beltane-scene,
//! and beltane-net: ids, parameter variants, spatial attributes, the audio
//! block abstraction, and configuration structs.

mod audio;
mod config;
mod param;
mod spatial;

pub use audio::AudioBlock;
pub use config::{NetConfig, SceneConfig};
pub use param::{ParamValue, TriggerParam};
pub use spatial::{Mat4, Pose};

/// Unique identifier for a voice. Assigned by the Primary's monotonic
/// counter, or mirrored verbatim on a Replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct VoiceId(u64);

impl VoiceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a voice slot. A slot belongs to exactly one of the
/// three index sets at any instant; transitions happen only inside
/// `merge_and_sweep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VoiceState {
    Free,
    PendingInsert,
    Active,
}

/// Which of the three periodic contexts owns temporal authority. Exactly one
/// context calls `merge_and_sweep` and advances the cycle counter; the other
/// two only read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TimeMasterMode {
    #[default]
    Audio,
    Graphics,
    Update,
}

/// Process role, decided once at startup by the control-port bind race.
/// Immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Primary,
    Replica,
}
