//! Service network layer: UDP protocol handling, the record book, and snapshot fan-out

use crate::client_manager::{Admission, ClientManager, Connection};
use bincode::{deserialize, serialize, serialized_size};
use log::{debug, error, info, warn};
use shared::{
    now_millis, Packet, PlayerPatch, RecordBook, RecordFilter, Snapshot, WriteMode,
    CLIENT_TIMEOUT, MAX_DATAGRAM, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to the main service loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { connection: Connection },
    Shutdown,
}

/// Messages sent from the service loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How often dirty record books are pushed to subscribers
    pub tick_duration: Duration,
    pub max_clients: usize,
    /// Silence after which a connection counts as ungracefully disconnected
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(50),
            max_clients: 64,
            client_timeout: CLIENT_TIMEOUT,
        }
    }
}

/// The presence store service
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    records: RecordBook,
    config: ServerConfig,
    /// Set by every accepted write, cleared by the next snapshot push
    dirty: bool,
    /// Last sequence number pushed per (subscriber address, token)
    sequences: HashMap<(SocketAddr, u32), u64>,
    tick: u64,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Presence store listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            records: RecordBook::new(),
            config,
            dirty: false,
            sequences: HashMap::new(),
            tick: 0,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn records(&self) -> &RecordBook {
        &self.records
    }

    /// Sender that can stop a running service with [`ServerMessage::Shutdown`]
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut outbound_rx =
            std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that removes silent connections
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let timeout = self.config.client_timeout;
        let period = (timeout / 2)
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(timeout)
                };

                for connection in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { connection }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        if data.len() > MAX_DATAGRAM {
            return Err(format!("packet of {} bytes exceeds datagram limit", data.len()).into());
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn reject(&self, addr: SocketAddr, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Rejecting request from {}: {}", addr, reason);
        self.send_packet(Packet::Rejected { reason }, addr);
    }

    /// Tells an address that sent a request without a binding to say hello again
    fn report_unbound(&self, addr: SocketAddr, request: &str) {
        debug!("{} from unbound address {}", request, addr);
        self.send_packet(Packet::Unbound { superseded: false }, addr);
    }

    fn next_sequence(&mut self, addr: SocketAddr, token: u32) -> u64 {
        let seq = self.sequences.entry((addr, token)).or_insert(0);
        *seq += 1;
        *seq
    }

    fn push_snapshot(&mut self, addr: SocketAddr, token: u32, filter: &RecordFilter) {
        let seq = self.next_sequence(addr, token);
        let mut snapshot = Snapshot {
            token,
            seq,
            records: self.records.snapshot(filter),
        };
        let dropped = fit_to_datagram(&mut snapshot);
        if !dropped.is_empty() {
            warn!(
                "Snapshot for {} token {} left out oversized records: {:?}",
                addr, token, dropped
            );
        }
        self.send_packet(Packet::Snapshot(snapshot), addr);
    }

    /// Applies a write to the record book, marking it dirty on success
    fn apply_write(&mut self, player_id: &str, patch: &PlayerPatch, mode: WriteMode) -> bool {
        match self.records.write(player_id, patch, mode, now_millis()) {
            Ok(()) => {
                self.dirty = true;
                true
            }
            Err(e) => {
                warn!("Dropping write: {}", e);
                false
            }
        }
    }

    /// Applies the connection's disconnect patch, if it registered one
    fn fire_disconnect_handler(&mut self, connection: Connection) {
        self.sequences.retain(|(addr, _), _| *addr != connection.addr);

        if let Some(patch) = connection.disconnect_patch {
            info!(
                "Applying disconnect handler for {} (connection {})",
                connection.player_id, connection.id
            );
            self.apply_write(&connection.player_id, &patch, WriteMode::Merge);
        }
    }

    /// Looks up the connection at `addr` and refreshes its liveness
    async fn touch(&self, addr: SocketAddr) -> Option<u32> {
        let mut clients = self.clients.write().await;
        clients.touch(addr)
    }

    async fn owns(&self, addr: SocketAddr, player_id: &str) -> bool {
        let clients = self.clients.read().await;
        clients.owns(addr, player_id)
    }

    /// Processes one incoming packet
    pub async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Hello {
                protocol_version,
                player_id,
            } => {
                info!(
                    "Hello from {} for player {} (protocol {})",
                    addr, player_id, protocol_version
                );

                if protocol_version != PROTOCOL_VERSION {
                    self.reject(
                        addr,
                        format!(
                            "Protocol version {} not supported (expected {})",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    );
                    return;
                }
                if player_id.is_empty() {
                    self.reject(addr, "Player id must not be empty");
                    return;
                }

                let admission = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr, &player_id)
                };

                match admission {
                    Admission::Accepted { replaced, .. } => {
                        for old in replaced {
                            if old.player_id == player_id {
                                // A reconnect keeps the record online; the old handler is dropped.
                                self.sequences.retain(|(a, _), _| *a != old.addr);
                                if old.addr != addr {
                                    let notice = Packet::Unbound { superseded: true };
                                    self.send_packet(notice, old.addr);
                                }
                            } else {
                                info!(
                                    "{} displaced {} at {}",
                                    player_id, old.player_id, old.addr
                                );
                                self.fire_disconnect_handler(old);
                            }
                        }
                        self.sequences.retain(|(a, _), _| *a != addr);
                        self.send_packet(
                            Packet::Welcome {
                                server_time: now_millis(),
                            },
                            addr,
                        );
                    }
                    Admission::Full => self.reject(addr, "Server full"),
                }
            }

            Packet::Write {
                player_id,
                patch,
                mode,
            } => {
                if self.touch(addr).await.is_none() {
                    self.report_unbound(addr, "Write");
                    return;
                }
                if !self.owns(addr, &player_id).await {
                    self.reject(addr, format!("Connection does not own record {}", player_id));
                    return;
                }
                if !self.apply_write(&player_id, &patch, mode) {
                    self.reject(addr, format!("Invalid write for {}", player_id));
                }
            }

            Packet::Subscribe { token, filter } => {
                let Some(connection_id) = self.touch(addr).await else {
                    self.report_unbound(addr, "Subscribe");
                    return;
                };
                {
                    let mut clients = self.clients.write().await;
                    clients.subscribe(connection_id, token, filter.clone());
                }
                debug!("{} subscribed with token {}", addr, token);
                self.sequences.remove(&(addr, token));
                self.push_snapshot(addr, token, &filter);
            }

            Packet::Unsubscribe { token } => {
                if let Some(connection_id) = self.touch(addr).await {
                    let mut clients = self.clients.write().await;
                    clients.unsubscribe(connection_id, token);
                }
                self.sequences.remove(&(addr, token));
            }

            Packet::RegisterDisconnect { player_id, patch } => {
                let Some(connection_id) = self.touch(addr).await else {
                    self.report_unbound(addr, "Disconnect handler");
                    return;
                };
                if !self.owns(addr, &player_id).await {
                    self.reject(
                        addr,
                        format!("Connection does not own record {}", player_id),
                    );
                    return;
                }
                if let Err(e) = patch.validate(&player_id) {
                    self.reject(addr, format!("Invalid disconnect handler: {}", e));
                    return;
                }
                let mut clients = self.clients.write().await;
                clients.set_disconnect_handler(connection_id, patch);
                debug!("Registered disconnect handler for {}", player_id);
            }

            Packet::Heartbeat { .. } => {
                if self.touch(addr).await.is_none() {
                    self.report_unbound(addr, "Heartbeat");
                }
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    match clients.find_client_by_addr(addr) {
                        Some(id) => clients.remove_client(id),
                        None => None,
                    }
                };
                if let Some(connection) = removed {
                    self.fire_disconnect_handler(connection);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Pushes a fresh snapshot to every subscription if anything changed
    pub async fn broadcast_snapshots(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let subscriptions = {
            let clients = self.clients.read().await;
            clients.subscriptions()
        };

        for (addr, token, filter) in subscriptions {
            self.push_snapshot(addr, token, &filter);
        }
    }

    /// Main service loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.config.tick_duration);

        info!("Presence store started");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { connection }) => {
                            info!("Connection {} for {} timed out",
                                  connection.id, connection.player_id);
                            self.fire_disconnect_handler(connection);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Presence store shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.tick += 1;
                    self.broadcast_snapshots().await;

                    if self.tick % 200 == 0 {
                        let connections = {
                            let clients = self.clients.read().await;
                            clients.len()
                        };
                        if connections > 0 {
                            debug!("Tick {}: {} connections, {} records ({} online), revision {}",
                                   self.tick, connections, self.records.len(),
                                   self.records.online_count(), self.records.revision());
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

/// Drops the largest records until the snapshot packet fits in one datagram, returning their ids
fn fit_to_datagram(snapshot: &mut Snapshot) -> Vec<String> {
    // bincode prefixes the enum payload with a u32 variant index.
    const VARIANT_TAG: u64 = 4;

    let mut dropped = Vec::new();
    loop {
        let size = serialized_size(&*snapshot).map_or(u64::MAX, |size| size + VARIANT_TAG);
        if size <= MAX_DATAGRAM as u64 || snapshot.records.is_empty() {
            return dropped;
        }
        let largest = snapshot
            .records
            .iter()
            .enumerate()
            .max_by_key(|(_, record)| serialized_size(record).unwrap_or(u64::MAX))
            .map(|(index, _)| index);
        if let Some(index) = largest {
            dropped.push(snapshot.records.remove(index).id);
        }
    }
}
