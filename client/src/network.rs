//! UDP client for the presence store service

use crate::store::{PresenceStore, StoreError, Subscription};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    now_millis, Packet, PlayerPatch, RecordFilter, Snapshot, WriteMode, HEARTBEAT_INTERVAL,
    MAX_DATAGRAM, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const HELLO_RETRY: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum Command {
    Send(Packet),
    Subscribe {
        token: u32,
        filter: RecordFilter,
        sender: mpsc::UnboundedSender<Snapshot>,
    },
    Unsubscribe {
        token: u32,
    },
    Close,
}

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
    player_id: String,
    rebound: Arc<AtomicBool>,
}

/// Presence store reached over UDP.
///
/// The socket lives on a background thread running its own tokio runtime, so every call here
/// returns immediately: writes are queued and sent fire-and-forget, snapshots are routed to the
/// channel of the subscription they belong to.
///
/// If the service forgets the binding (heartbeat timeout, restart) the worker says hello again,
/// restores the disconnect handler and subscriptions, and reports it through
/// [`PresenceStore::take_rebound`]. A player that connected from somewhere else ends the worker.
pub struct RemoteStore {
    server_addr: SocketAddr,
    fake_ping_ms: u64,
    heartbeat: Duration,
    next_token: Arc<AtomicU32>,
    worker: Option<Worker>,
}

impl RemoteStore {
    pub fn new(server_addr: &str, fake_ping_ms: u64) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            server_addr: server_addr.parse()?,
            fake_ping_ms,
            heartbeat: HEARTBEAT_INTERVAL,
            next_token: Arc::new(AtomicU32::new(0)),
            worker: None,
        })
    }

    /// Overrides how often the worker proves liveness. Applies from the next `connect`.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn send_command(&self, command: Command) -> Result<(), StoreError> {
        let worker = self.worker.as_ref().ok_or(StoreError::Closed)?;
        worker.commands.send(command).map_err(|_| StoreError::Closed)
    }

    fn bound_player(&self) -> Result<&str, StoreError> {
        self.worker
            .as_ref()
            .map(|w| w.player_id.as_str())
            .ok_or(StoreError::Closed)
    }

    fn check_owner(&self, player_id: &str) -> Result<(), StoreError> {
        let bound = self.bound_player()?;
        if bound != player_id {
            return Err(StoreError::NotOwner {
                bound: bound.to_string(),
                requested: player_id.to_string(),
            });
        }
        Ok(())
    }

    fn shutdown_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.commands.send(Command::Close);
            drop(worker.commands);
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("Network worker panicked");
                }
            }
        }
    }
}

impl PresenceStore for RemoteStore {
    fn connect(&mut self, player_id: &str) -> Result<(), StoreError> {
        self.shutdown_worker();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let rebound = Arc::new(AtomicBool::new(false));
        let link = Link {
            socket: None,
            server_addr: self.server_addr,
            player_id: player_id.to_string(),
            fake_ping_ms: self.fake_ping_ms,
            routes: HashMap::new(),
            disconnect_patch: None,
            next_token: Arc::clone(&self.next_token),
            rebound: Arc::clone(&rebound),
        };
        let heartbeat = self.heartbeat;

        let thread = std::thread::Builder::new()
            .name("presence-net".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                runtime.block_on(run_worker(link, heartbeat, command_rx, ready_tx));
            })?;

        let handshake = ready_rx
            .recv()
            .map_err(|_| StoreError::Handshake("network worker exited".to_string()))
            .and_then(|result| result.map_err(StoreError::Handshake));

        match handshake {
            Ok(()) => {
                info!("Connected to {} as {}", self.server_addr, player_id);
                self.worker = Some(Worker {
                    commands,
                    thread: Some(thread),
                    player_id: player_id.to_string(),
                    rebound,
                });
                Ok(())
            }
            Err(e) => {
                drop(commands);
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |w| !w.commands.is_closed())
    }

    fn take_rebound(&mut self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |w| w.rebound.swap(false, Ordering::AcqRel))
    }

    fn write(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        self.check_owner(player_id)?;
        self.send_command(Command::Send(Packet::Write {
            player_id: player_id.to_string(),
            patch,
            mode,
        }))
    }

    fn subscribe(&mut self, filter: RecordFilter) -> Result<Subscription, StoreError> {
        let token = allocate_token(&self.next_token);
        let (sender, snapshots) = mpsc::unbounded_channel();
        self.send_command(Command::Subscribe {
            token,
            filter,
            sender,
        })?;
        Ok(Subscription { token, snapshots })
    }

    fn unsubscribe(&mut self, token: u32) {
        if self.send_command(Command::Unsubscribe { token }).is_err() {
            debug!("Unsubscribe {} after close", token);
        }
    }

    fn register_disconnect_handler(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
    ) -> Result<(), StoreError> {
        self.check_owner(player_id)?;
        self.send_command(Command::Send(Packet::RegisterDisconnect {
            player_id: player_id.to_string(),
            patch,
        }))
    }

    /// Sends everything still queued followed by `Disconnect`, then waits for the worker to exit.
    fn close(&mut self) {
        self.shutdown_worker();
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn allocate_token(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Sends on a socket already connected to the service.
async fn send_packet(
    socket: &UdpSocket,
    packet: &Packet,
    fake_ping_ms: u64,
) -> Result<(), StoreError> {
    if fake_ping_ms > 0 {
        sleep(Duration::from_millis(fake_ping_ms / 2)).await;
    }

    let data = serialize(packet)?;
    socket.send(&data).await?;
    Ok(())
}

/// Binds a socket and says hello on it.
async fn handshake(
    server_addr: SocketAddr,
    player_id: &str,
    fake_ping_ms: u64,
) -> Result<UdpSocket, String> {
    let bind_addr = if server_addr.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| e.to_string())?;
    socket.connect(server_addr).await.map_err(|e| e.to_string())?;
    greet(&socket, server_addr, player_id, fake_ping_ms).await?;
    Ok(socket)
}

/// Repeats `Hello` until the service welcomes or rejects us.
async fn greet(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    player_id: &str,
    fake_ping_ms: u64,
) -> Result<(), String> {
    let hello = Packet::Hello {
        protocol_version: PROTOCOL_VERSION,
        player_id: player_id.to_string(),
    };
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    while Instant::now() < deadline {
        send_packet(socket, &hello, fake_ping_ms)
            .await
            .map_err(|e| e.to_string())?;

        match timeout(HELLO_RETRY, socket.recv(&mut buffer)).await {
            Ok(Ok(len)) => match deserialize::<Packet>(&buffer[..len]) {
                Ok(Packet::Welcome { server_time }) => {
                    debug!("Welcome received (server time {})", server_time);
                    return Ok(());
                }
                Ok(Packet::Rejected { reason }) => return Err(reason),
                Ok(other) => debug!("Ignoring {:?} during handshake", other),
                Err(e) => warn!("Failed to deserialize handshake reply: {}", e),
            },
            // Connection refused surfaces here on some platforms; keep retrying until the deadline.
            Ok(Err(e)) => {
                debug!("Handshake receive error: {}", e);
                sleep(HELLO_RETRY).await;
            }
            Err(_) => debug!("Hello to {} unanswered, retrying", server_addr),
        }
    }

    Err(format!("no answer from {} within {:?}", server_addr, HANDSHAKE_TIMEOUT))
}

/// A subscription as the worker tracks it. `wire_token` changes whenever the binding is restored.
struct Route {
    wire_token: u32,
    filter: RecordFilter,
    sender: mpsc::UnboundedSender<Snapshot>,
}

/// Everything the worker must replay after the service forgets us.
struct Link {
    socket: Option<UdpSocket>,
    server_addr: SocketAddr,
    player_id: String,
    fake_ping_ms: u64,
    /// Keyed by the token the caller holds
    routes: HashMap<u32, Route>,
    disconnect_patch: Option<PlayerPatch>,
    next_token: Arc<AtomicU32>,
    rebound: Arc<AtomicBool>,
}

impl Link {
    async fn send(&self, packet: &Packet) -> Result<(), StoreError> {
        match &self.socket {
            Some(socket) => send_packet(socket, packet, self.fake_ping_ms).await,
            None => Err(StoreError::Closed),
        }
    }

    fn route(&self, snapshot: Snapshot) {
        match self
            .routes
            .values()
            .find(|route| route.wire_token == snapshot.token)
        {
            Some(route) => {
                if route.sender.send(snapshot).is_err() {
                    debug!("Subscriber went away, dropping snapshot");
                }
            }
            None => debug!("Snapshot for unknown token {}", snapshot.token),
        }
    }

    async fn subscribe(
        &mut self,
        token: u32,
        filter: RecordFilter,
        sender: mpsc::UnboundedSender<Snapshot>,
    ) {
        let packet = Packet::Subscribe {
            token,
            filter: filter.clone(),
        };
        self.routes.insert(
            token,
            Route {
                wire_token: token,
                filter,
                sender,
            },
        );
        if let Err(e) = self.send(&packet).await {
            error!("Failed to subscribe: {}", e);
        }
    }

    async fn unsubscribe(&mut self, token: u32) {
        let Some(route) = self.routes.remove(&token) else {
            return;
        };
        let packet = Packet::Unsubscribe {
            token: route.wire_token,
        };
        if let Err(e) = self.send(&packet).await {
            debug!("Failed to unsubscribe: {}", e);
        }
    }

    /// Says hello again on the same socket, then replays the disconnect handler and every
    /// subscription under fresh tokens so stale sequence numbers cannot shadow new snapshots.
    async fn rebind(&mut self) -> Result<(), String> {
        let Some(socket) = &self.socket else {
            return Err("no socket".to_string());
        };
        greet(socket, self.server_addr, &self.player_id, self.fake_ping_ms).await?;

        if let Some(patch) = self.disconnect_patch.clone() {
            let packet = Packet::RegisterDisconnect {
                player_id: self.player_id.clone(),
                patch,
            };
            if let Err(e) = self.send(&packet).await {
                warn!("Failed to restore disconnect handler: {}", e);
            }
        }

        let mut resubscribe = Vec::with_capacity(self.routes.len());
        for route in self.routes.values_mut() {
            route.wire_token = allocate_token(&self.next_token);
            resubscribe.push(Packet::Subscribe {
                token: route.wire_token,
                filter: route.filter.clone(),
            });
        }
        for packet in &resubscribe {
            if let Err(e) = self.send(packet).await {
                warn!("Failed to restore subscription: {}", e);
            }
        }

        self.rebound.store(true, Ordering::Release);
        info!(
            "Binding for {} restored with {} subscriptions",
            self.player_id,
            resubscribe.len()
        );
        Ok(())
    }
}

async fn run_worker(
    mut link: Link,
    heartbeat_every: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: std_mpsc::Sender<Result<(), String>>,
) {
    match handshake(link.server_addr, &link.player_id, link.fake_ping_ms).await {
        Ok(socket) => link.socket = Some(socket),
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut heartbeat = interval(heartbeat_every);
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        let Some(socket) = &link.socket else {
            break;
        };
        tokio::select! {
            result = socket.recv(&mut buffer) => {
                match result {
                    Ok(len) => {
                        if link.fake_ping_ms > 0 {
                            sleep(Duration::from_millis(link.fake_ping_ms / 2)).await;
                        }

                        match deserialize::<Packet>(&buffer[..len]) {
                            Ok(Packet::Snapshot(snapshot)) => link.route(snapshot),
                            Ok(Packet::Unbound { superseded: true }) => {
                                warn!("{} connected from elsewhere, closing", link.player_id);
                                break;
                            }
                            Ok(Packet::Unbound { superseded: false }) => {
                                warn!("Store lost the binding for {}", link.player_id);
                                if let Err(reason) = link.rebind().await {
                                    warn!("Rebinding {} failed: {}", link.player_id, reason);
                                }
                            }
                            Ok(Packet::Rejected { reason }) => {
                                warn!("Store rejected request: {}", reason);
                            }
                            Ok(Packet::Welcome { .. }) => {}
                            Ok(other) => warn!("Unexpected packet type: {:?}", other),
                            Err(e) => warn!("Failed to deserialize packet: {}", e),
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                }
            },

            command = commands.recv() => {
                match command {
                    Some(Command::Send(packet)) => {
                        if let Packet::RegisterDisconnect { patch, .. } = &packet {
                            link.disconnect_patch = Some(patch.clone());
                        }
                        if let Err(e) = link.send(&packet).await {
                            debug!("Dropped outgoing packet: {}", e);
                        }
                    }
                    Some(Command::Subscribe { token, filter, sender }) => {
                        link.subscribe(token, filter, sender).await;
                    }
                    Some(Command::Unsubscribe { token }) => link.unsubscribe(token).await,
                    Some(Command::Close) => {
                        if let Err(e) = link.send(&Packet::Disconnect).await {
                            warn!("Failed to send disconnect: {}", e);
                        }
                        break;
                    }
                    // Handle dropped without close: vanish silently and let the store time us out.
                    None => break,
                }
            },

            _ = heartbeat.tick() => {
                let packet = Packet::Heartbeat { timestamp: now_millis() };
                if let Err(e) = link.send(&packet).await {
                    debug!("Heartbeat failed: {}", e);
                }
            },
        }
    }

    info!("Network worker for {} stopped", link.player_id);
}
