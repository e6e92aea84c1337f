//! Configuration structs for the scheduler and the replication layer.

use serde::{Deserialize, Serialize};

use crate::TimeMasterMode;

/// Scene scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Voice slot capacity of the registry arena.
    pub max_voices: usize,
    /// Which periodic context advances the clock.
    pub time_master: TimeMasterMode,
    /// Dedicated audio render workers. 0 renders serially on the calling
    /// thread.
    pub audio_workers: usize,
    /// Run per-voice update() through the shared thread pool.
    pub parallel_update: bool,
    /// Output channel count of the mix bus.
    pub channels: usize,
    /// Frames per render block.
    pub block_frames: usize,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            max_voices: 256,
            time_master: TimeMasterMode::Audio,
            audio_workers: 0,
            parallel_update: false,
            channels: 2,
            block_frames: 512,
        }
    }
}

/// Network configuration shared by role election, replication, and the
/// control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Scene name, the first segment of every replication address.
    pub scene_name: String,
    /// Host or address of the Primary's control listener, as seen from
    /// this process.
    pub primary_host: String,
    /// Well-known control port used for the role bind race and the
    /// control-connection listener.
    pub control_port: u16,
    /// UDP port a Replica listens on for replication messages.
    pub replication_port: u16,
    /// Replica endpoints the Primary broadcasts to, as `host:port`.
    pub replica_endpoints: Vec<String>,
    /// Protocol version carried in the control handshake.
    pub protocol_version: u16,
    /// Protocol revision carried in the control handshake.
    pub protocol_revision: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            scene_name: "scene".to_string(),
            primary_host: "127.0.0.1".to_string(),
            control_port: 7401,
            replication_port: 7402,
            replica_endpoints: Vec::new(),
            protocol_version: 1,
            protocol_revision: 0,
        }
    }
}
