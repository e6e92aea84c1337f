//! # beltane-net
//!
//! Cross-process replication for a scene scheduler: one Primary is the
//! sole source of truth for voice lifecycle and parameter changes, and
//! Replicas mirror that state by consuming a stream of small replicated
//! messages. Also provides the control-plane handshake/heartbeat protocol
//! used to discover and health-check peers.

mod control;
mod error;
mod message;
mod replication;

pub use control::{ControlClient, ControlServer, PeerId, PROTOCOL_REVISION, PROTOCOL_VERSION};
pub use error::ProtocolError;
pub use message::{
    decode_event, encode_all_off, encode_param, encode_remove, encode_trigger_off,
    encode_trigger_on, ReplicationEvent,
};
pub use replication::{resolve_role, ChannelState, ReplicationChannel, VoiceFactory};
