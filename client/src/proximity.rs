//! Interaction eligibility from positions, reported as edge-triggered events

use log::debug;
use shared::{Position, TileMap, NPC_CHAT_RANGE, PEER_INTERACT_RANGE};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityConfig {
    /// Distance below which the NPC will talk
    pub npc_range: f32,
    /// Distance below which a peer is interaction-eligible
    pub peer_range: f32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            npc_range: NPC_CHAT_RANGE,
            peer_range: PEER_INTERACT_RANGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityEvent {
    NpcEntered,
    NpcLeft,
    PeerEntered(String),
    PeerLeft(String),
}

/// Tracks which thresholds the local player is currently inside and reports only the changes.
#[derive(Debug, Default)]
pub struct ProximityEvaluator {
    config: ProximityConfig,
    near_npc: bool,
    near_peers: HashSet<String>,
}

impl ProximityEvaluator {
    pub fn new(config: ProximityConfig) -> Self {
        Self {
            config,
            near_npc: false,
            near_peers: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn is_near_npc(&self) -> bool {
        self.near_npc
    }

    pub fn near_peers(&self) -> &HashSet<String> {
        &self.near_peers
    }

    pub fn can_interact(&self, peer_id: &str) -> bool {
        self.near_peers.contains(peer_id)
    }

    /// A peer is eligible when strictly inside the peer range or in the same zone as the local
    /// player, whichever holds.
    pub fn peer_eligible(&self, map: &TileMap, local: Position, peer: Position) -> bool {
        if local.distance_to(&peer) < self.config.peer_range {
            return true;
        }
        match (map.zone_at(local), map.zone_at(peer)) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    /// Re-evaluates every threshold. Peers missing from `peers` count as out of range.
    pub fn evaluate<'a, I>(
        &mut self,
        map: &TileMap,
        local: Position,
        npc: Position,
        peers: I,
    ) -> Vec<ProximityEvent>
    where
        I: IntoIterator<Item = (&'a str, Position)>,
    {
        let mut events = Vec::new();

        let near_npc = local.distance_to(&npc) < self.config.npc_range;
        if near_npc != self.near_npc {
            self.near_npc = near_npc;
            events.push(if near_npc {
                ProximityEvent::NpcEntered
            } else {
                ProximityEvent::NpcLeft
            });
        }

        let mut eligible = HashSet::new();
        for (id, position) in peers {
            if self.peer_eligible(map, local, position) {
                eligible.insert(id.to_string());
            }
        }

        let mut left: Vec<&String> = self.near_peers.difference(&eligible).collect();
        left.sort();
        events.extend(left.into_iter().map(|id| ProximityEvent::PeerLeft(id.clone())));

        let mut entered: Vec<&String> = eligible.difference(&self.near_peers).collect();
        entered.sort();
        events.extend(
            entered
                .into_iter()
                .map(|id| ProximityEvent::PeerEntered(id.clone())),
        );

        if !events.is_empty() {
            debug!("Proximity changed: {:?}", events);
        }
        self.near_peers = eligible;
        events
    }

    /// Forgets all state without emitting events.
    pub fn reset(&mut self) {
        self.near_npc = false;
        self.near_peers.clear();
    }
}
