//! The replication channel.
//!
//! Role election is a bind race on the well-known control port: the first
//! process to bind is the Primary and keeps the listener for its control
//! server; every later process gets `AddrInUse` and becomes a Replica.
//!
//! The Primary installs a `SceneHook` that encodes every lifecycle
//! transition and parameter change and sends it fire-and-forget over UDP
//! to each replica endpoint. A Replica runs one receiver thread that
//! decodes datagrams and applies them through the same scene API local
//! callers use, so replicated and local mutation never diverge in code
//! path. A lost `triggerOn` diverges for that voice's lifetime; there is
//! no resync pass.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use rosc::{OscMessage, OscPacket};

use beltane_scene::{SceneHook, SceneScheduler};
use beltane_types::{NetConfig, ParamValue, Role, TriggerParam, VoiceId};
use beltane_voice::Voice;

use crate::control::{ControlClient, ControlServer};
use crate::message::{
    decode_event, encode_all_off, encode_param, encode_remove, encode_trigger_off,
    encode_trigger_on, ReplicationEvent,
};

/// Builds voices for replicated `triggerOn` events when the free pool has
/// no voice of the requested type to reuse.
pub trait VoiceFactory: Send + Sync {
    fn create(&self, type_name: &str) -> Option<Box<dyn Voice>>;
}

impl<F> VoiceFactory for F
where
    F: Fn(&str) -> Option<Box<dyn Voice>> + Send + Sync,
{
    fn create(&self, type_name: &str) -> Option<Box<dyn Voice>> {
        self(type_name)
    }
}

/// Bind race on the control port. The winning listener is handed back so
/// the Primary's control server can serve on the very socket that won the
/// race; closing and rebinding would open a window for a second winner.
pub fn resolve_role(control_port: u16) -> (Role, Option<TcpListener>) {
    match TcpListener::bind(("0.0.0.0", control_port)) {
        Ok(listener) => (Role::Primary, Some(listener)),
        Err(_) => (Role::Replica, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unresolved,
    Resolved(Role),
    Running(Role),
    Stopped,
}

struct ReplicationHook {
    socket: UdpSocket,
    endpoints: Vec<SocketAddr>,
    scene_name: String,
}

impl ReplicationHook {
    fn send(&self, msg: OscMessage) {
        let buf = match rosc::encoder::encode(&OscPacket::Message(msg)) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("failed to encode replication message: {:?}", e);
                return;
            }
        };
        for ep in &self.endpoints {
            if let Err(e) = self.socket.send_to(&buf, ep) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    warn!("replication send to {} failed: {}", ep, e);
                }
            }
        }
    }
}

impl SceneHook for ReplicationHook {
    fn on_trigger_on(
        &mut self,
        id: VoiceId,
        start_offset: u32,
        voice_type: &str,
        params: &[TriggerParam],
    ) {
        self.send(encode_trigger_on(
            &self.scene_name,
            start_offset,
            id,
            voice_type,
            params,
        ));
    }

    fn on_trigger_off(&mut self, id: VoiceId) {
        self.send(encode_trigger_off(&self.scene_name, id));
    }

    fn on_remove(&mut self, id: VoiceId) {
        self.send(encode_remove(&self.scene_name, id));
    }

    fn on_all_off(&mut self) {
        self.send(encode_all_off(&self.scene_name));
    }

    fn on_param(&mut self, id: VoiceId, addr: &str, value: &ParamValue) {
        self.send(encode_param(&self.scene_name, id, addr, value));
    }
}

/// One end of the replication link, Primary or Replica depending on who
/// won the bind race.
pub struct ReplicationChannel {
    role: Role,
    state: Mutex<ChannelState>,
    server: Option<ControlServer>,
    client: Option<ControlClient>,
    stop: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
}

impl ReplicationChannel {
    /// Resolve the role and start the channel. The Primary installs the
    /// replication hook on `scene`; a Replica installs nothing and starts
    /// its receive thread instead.
    pub fn start(
        scene: Arc<SceneScheduler>,
        config: NetConfig,
        factory: Arc<dyn VoiceFactory>,
    ) -> io::Result<Self> {
        let (role, listener) = resolve_role(config.control_port);
        info!("role resolved: {:?}", role);

        match role {
            Role::Primary => Self::start_primary(scene, config, listener),
            Role::Replica => Self::start_replica(scene, config, factory),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ChannelState::Stopped)
    }

    pub fn control_server(&self) -> Option<&ControlServer> {
        self.server.as_ref()
    }

    pub fn control_client(&self) -> Option<&ControlClient> {
        self.client.as_ref()
    }

    fn start_primary(
        scene: Arc<SceneScheduler>,
        config: NetConfig,
        listener: Option<TcpListener>,
    ) -> io::Result<Self> {
        let listener = listener
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "lost control listener"))?;
        let server = ControlServer::from_listener(listener)?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;

        let mut endpoints = Vec::new();
        for ep in &config.replica_endpoints {
            match ep.to_socket_addrs() {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        endpoints.push(addr);
                    }
                }
                Err(e) => warn!("replica endpoint '{}' did not resolve: {}", ep, e),
            }
        }
        info!(
            "primary replicating '{}' to {} endpoint(s)",
            config.scene_name,
            endpoints.len()
        );

        scene.set_hook(Box::new(ReplicationHook {
            socket,
            endpoints,
            scene_name: config.scene_name.clone(),
        }));

        Ok(Self {
            role: Role::Primary,
            state: Mutex::new(ChannelState::Running(Role::Primary)),
            server: Some(server),
            client: None,
            stop: Arc::new(AtomicBool::new(false)),
            recv_thread: None,
        })
    }

    fn start_replica(
        scene: Arc<SceneScheduler>,
        config: NetConfig,
        factory: Arc<dyn VoiceFactory>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.replication_port))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        // The control link is advisory: the replica still consumes
        // replication traffic when the handshake cannot complete yet.
        let control_addr = format!("{}:{}", config.primary_host, config.control_port);
        let client = match ControlClient::connect(&control_addr) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("control connect failed, continuing without: {}", e);
                None
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let scene_name = config.scene_name.clone();
        let recv_stop = stop.clone();
        let recv_thread = thread::Builder::new()
            .name("replication-recv".into())
            .spawn(move || {
                replica_recv_loop(socket, scene, factory, scene_name, recv_stop);
            })?;

        info!("replica listening on udp port {}", config.replication_port);

        Ok(Self {
            role: Role::Replica,
            state: Mutex::new(ChannelState::Running(Role::Replica)),
            server: None,
            client,
            stop,
            recv_thread: Some(recv_thread),
        })
    }

    /// Stop the channel: join the receive thread, say goodbye on the
    /// control link, and shut the control server down.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.recv_thread.take() {
            let _ = t.join();
        }
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        if let Ok(mut state) = self.state.lock() {
            *state = ChannelState::Stopped;
        }
    }
}

impl Drop for ReplicationChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn replica_recv_loop(
    socket: UdpSocket,
    scene: Arc<SceneScheduler>,
    factory: Arc<dyn VoiceFactory>,
    scene_name: String,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 65_536];
    while !stop.load(Ordering::Acquire) {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("replication recv error: {}", e);
                break;
            }
        };
        match rosc::decoder::decode_udp(&buf[..n]) {
            Ok((_, packet)) => apply_packet(&scene, factory.as_ref(), &scene_name, packet),
            Err(e) => warn!("dropping undecodable datagram: {:?}", e),
        }
    }
    info!("replication receiver exiting");
}

fn apply_packet(
    scene: &SceneScheduler,
    factory: &dyn VoiceFactory,
    scene_name: &str,
    packet: OscPacket,
) {
    match packet {
        OscPacket::Message(msg) => match decode_event(scene_name, &msg) {
            Ok(event) => apply_event(scene, factory, event),
            Err(e) => warn!("dropping message '{}': {}", msg.addr, e),
        },
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                apply_packet(scene, factory, scene_name, inner);
            }
        }
    }
}

/// Apply one decoded event through the local scene API. The replica
/// installs no hook, so nothing applied here is re-emitted.
fn apply_event(scene: &SceneScheduler, factory: &dyn VoiceFactory, event: ReplicationEvent) {
    match event {
        ReplicationEvent::TriggerOn {
            offset,
            id,
            voice_type,
            params,
        } => {
            let voice = scene
                .registry()
                .acquire_free_voice(&voice_type)
                .or_else(|| factory.create(&voice_type));
            let Some(mut voice) = voice else {
                warn!("no voice of type '{}' available, dropping {}", voice_type, id);
                return;
            };
            // Values travel positionally; map them back through the
            // voice's own parameter declaration order.
            let decls = voice.trigger_params();
            for (decl, value) in decls.iter().zip(params.iter()) {
                voice.set_param(&decl.addr, value);
            }
            if scene.trigger_on(voice, offset, Some(id)).is_none() {
                warn!("registry full, dropping replicated voice {}", id);
            }
        }
        ReplicationEvent::TriggerOff { id } => scene.trigger_off(id),
        ReplicationEvent::Remove { id } => {
            // The Primary already reclaimed this voice; release it here and
            // let the local sweep reclaim it. Unknown id is a no-op.
            if let Some(handle) = scene.registry().find_active(id) {
                scene.registry().with_voice(handle, |cell| {
                    if let Some(v) = cell.voice.as_mut() {
                        v.release();
                    }
                });
            }
        }
        ReplicationEvent::AllNotesOff => scene.all_off(),
        ReplicationEvent::Param { id, addr, value } => {
            scene.set_param_direct(id, &addr, &value);
        }
    }
}
