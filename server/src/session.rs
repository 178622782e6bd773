//! Session lifecycle and sequence-number bookkeeping
//!
//! This module owns the set of connected sessions, assigns stable
//! small-integer session ids, and keeps a short-lived record of recently
//! disconnected identities so reputation and kick votes survive a
//! reconnect within the same logical match.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use log::{info, warn};
use shared::{
    id_after, ChatEntry, ChatMode, EntityId, NetId, SessionId,
};

use crate::error::LoginRefusal;
use crate::permissions::Permissions;

/// Who a session is, for reconnection matching and moderation. Account-id
/// equality wins when both sides have one; otherwise the address decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub addr: IpAddr,
    pub account_id: Option<shared::AccountId>,
}

impl Identity {
    pub fn matches(&self, other: &Identity) -> bool {
        match (self.account_id, other.account_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.addr == other.addr,
        }
    }
}

/// Per-stream acknowledgement windows. Every comparison on these values
/// goes through the wraparound helpers in `shared::seq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCursors {
    /// Newest chat id queued for delivery to this session.
    pub last_sent_chat: NetId,
    /// Newest queued-chat id the session has acknowledged receiving.
    pub last_recv_chat: NetId,
    /// Newest chat id accepted *from* this session.
    pub last_chat_from_client: NetId,
    /// Newest entity event id written to this session.
    pub last_sent_entity_event: NetId,
    /// Newest entity event id the session has acknowledged.
    pub last_recv_entity_event: NetId,
    /// Newest client-originated entity event id processed in order.
    pub last_client_event: NetId,
    /// Client-list revision the session has acknowledged.
    pub last_recv_client_list: NetId,
    /// Lobby settings revision the session has acknowledged.
    pub last_recv_lobby: NetId,
    /// Campaign revision the session has acknowledged.
    pub last_recv_campaign: NetId,
}

/// Catch-up state for a session that joined after the round started.
#[derive(Debug, Clone, Copy)]
pub struct MidRoundSync {
    /// How many unique entity-spawning events the session missed.
    pub unreceived_count: u16,
    /// Id of the first live event created after the session joined.
    pub first_new_event_id: NetId,
    /// Server-clock deadline after which catch-up is aborted.
    pub deadline: f64,
}

/// One connected remote peer.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub identity: Identity,
    pub name: String,
    pub permissions: Permissions,
    pub console_commands: HashSet<String>,
    pub is_owner: bool,

    pub cursors: SequenceCursors,

    /// Reputation score, 0–100.
    pub karma: f32,
    /// Score value at the last warning sent to the session.
    pub last_notified_karma: f32,
    /// How many times this identity has been auto-punished for low karma.
    pub karma_kick_count: u32,
    /// Sessions that currently vote to kick this one.
    pub kick_voters: HashSet<SessionId>,

    pub in_game: bool,
    pub ready: bool,
    pub midround_sync: Option<MidRoundSync>,

    /// Per-event wall-clock of the last (re)send, for resend backoff.
    pub event_last_sent: HashMap<NetId, f64>,
    /// Per-entity wall-clock of the last position-lane send.
    pub position_last_sent: HashMap<EntityId, f64>,
    /// Chat lines queued for this session, pruned behind `last_recv_chat`.
    pub chat_queue: VecDeque<ChatEntry>,

    pub connected_at: f64,
    pub last_seen: f64,
    pub ping_ms: u16,
    pub ping_sent_at: Option<(u32, f64)>,

    pub spam_offenses: u32,
    pub recent_chat_times: VecDeque<f64>,
}

impl ClientSession {
    fn new(id: SessionId, identity: Identity, name: String, now: f64) -> Self {
        Self {
            id,
            identity,
            name,
            permissions: Permissions::NONE,
            console_commands: HashSet::new(),
            is_owner: false,
            cursors: SequenceCursors::default(),
            karma: 100.0,
            last_notified_karma: 100.0,
            karma_kick_count: 0,
            kick_voters: HashSet::new(),
            in_game: false,
            ready: false,
            midround_sync: None,
            event_last_sent: HashMap::new(),
            position_last_sent: HashMap::new(),
            chat_queue: VecDeque::new(),
            connected_at: now,
            last_seen: now,
            ping_ms: 0,
            ping_sent_at: None,
            spam_offenses: 0,
            recent_chat_times: VecDeque::new(),
        }
    }

    pub fn needs_midround_sync(&self) -> bool {
        self.midround_sync.is_some()
    }

    pub fn touch(&mut self, now: f64) {
        self.last_seen = now;
    }

    pub fn is_timed_out(&self, timeout_seconds: f32, now: f64) -> bool {
        now - self.last_seen > f64::from(timeout_seconds)
    }

    /// Queues a chat line for this session under the next chat id.
    pub fn queue_chat(
        &mut self,
        sender: Option<SessionId>,
        sender_name: &str,
        text: &str,
        mode: ChatMode,
    ) {
        let id = id_after(self.cursors.last_sent_chat);
        self.cursors.last_sent_chat = id;
        self.chat_queue.push_back(ChatEntry {
            id,
            sender,
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            mode,
        });
    }

    /// Advances the server-to-client chat ack and prunes delivered lines.
    /// Stale reports leave the cursor untouched.
    pub fn ack_chat(&mut self, reported: NetId) {
        if shared::id_more_recent(reported, self.cursors.last_recv_chat)
            && !shared::id_more_recent(reported, self.cursors.last_sent_chat)
        {
            self.cursors.last_recv_chat = reported;
        }
        let acked = self.cursors.last_recv_chat;
        self.chat_queue
            .retain(|entry| shared::id_more_recent(entry.id, acked));
    }

    /// Wipes per-round scratch state (position dedup map, event send times,
    /// catch-up state). Called on round end so eviction is explicit.
    pub fn reset_round_state(&mut self) {
        self.in_game = false;
        self.ready = false;
        self.midround_sync = None;
        self.event_last_sent.clear();
        self.position_last_sent.clear();
        self.cursors.last_sent_entity_event = 0;
        self.cursors.last_recv_entity_event = 0;
        self.cursors.last_client_event = 0;
    }
}

/// What survives a disconnect: identity, reputation and kick-vote state,
/// kept for a limited retention window.
#[derive(Debug, Clone)]
pub struct DisconnectedRecord {
    pub identity: Identity,
    pub name: String,
    pub karma: f32,
    pub karma_kick_count: u32,
    pub kick_voters: HashSet<SessionId>,
    pub disconnected_at: f64,
}

/// Owns connected sessions and the recently-disconnected set.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, ClientSession>,
    recently_disconnected: Vec<DisconnectedRecord>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            recently_disconnected: Vec::new(),
            max_sessions,
        }
    }

    /// Smallest session id ≥ 1 not currently in use.
    fn allocate_id(&self) -> SessionId {
        let mut candidate: SessionId = 1;
        while self.sessions.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Creates a session for an authenticated identity, restoring
    /// reputation and kick-vote state from a matching recently-disconnected
    /// record when there is one.
    pub fn on_authenticated(
        &mut self,
        identity: Identity,
        name: String,
        now: f64,
    ) -> Result<SessionId, LoginRefusal> {
        if self.sessions.len() >= self.max_sessions {
            return Err(LoginRefusal::ServerFull);
        }

        let id = self.allocate_id();
        let mut session = ClientSession::new(id, identity, name, now);

        if let Some(index) = self
            .recently_disconnected
            .iter()
            .position(|record| record.identity.matches(&session.identity))
        {
            let record = self.recently_disconnected.swap_remove(index);
            session.karma = record.karma;
            session.last_notified_karma = record.karma;
            session.karma_kick_count = record.karma_kick_count;
            session.kick_voters = record.kick_voters;
            info!(
                "Session {} ({}) reconnected, restored karma {:.1} and {} kick vote(s)",
                id,
                session.name,
                session.karma,
                session.kick_voters.len()
            );
        } else {
            info!("Session {} ({}) connected", id, session.name);
        }

        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Moves a session into the recently-disconnected set. Disconnecting an
    /// unknown session is a logged no-op.
    pub fn on_disconnect(
        &mut self,
        id: SessionId,
        reason: &str,
        now: f64,
    ) -> Option<ClientSession> {
        let Some(session) = self.sessions.remove(&id) else {
            warn!("Disconnect for unknown session {} ({})", id, reason);
            return None;
        };

        info!("Session {} ({}) disconnected: {}", id, session.name, reason);
        // replace an older record for the same identity
        self.recently_disconnected
            .retain(|record| !record.identity.matches(&session.identity));
        self.recently_disconnected.push(DisconnectedRecord {
            identity: session.identity.clone(),
            name: session.name.clone(),
            karma: session.karma,
            karma_kick_count: session.karma_kick_count,
            kick_voters: session.kick_voters.clone(),
            disconnected_at: now,
        });
        Some(session)
    }

    /// Sessions that have been silent past the timeout. The owner session
    /// is never timed out.
    pub fn check_timeouts(&self, timeout_seconds: f32, now: f64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| !s.is_owner && s.is_timed_out(timeout_seconds, now))
            .map(|s| s.id)
            .collect()
    }

    pub fn purge_expired_records(&mut self, retention_seconds: f64, now: f64) {
        self.recently_disconnected
            .retain(|record| now - record.disconnected_at < retention_seconds);
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently counted as actively playing, for vote eligibility.
    pub fn eligible_voters(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.in_game)
            .map(|s| s.id)
            .collect()
    }

    #[cfg(test)]
    pub fn recently_disconnected(&self) -> &[DisconnectedRecord] {
        &self.recently_disconnected
    }
}
