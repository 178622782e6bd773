//! Server core: the fixed tick loop that orchestrates everything
//!
//! Inbound transport messages are drained at the start of a tick, all state
//! mutation happens synchronously inside the tick, and outbound packets are
//! produced at the end. Nothing here blocks: every multi-tick wait (vote
//! timers, catch-up deadlines, round start grace) is a deadline checked
//! each tick.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{
    id_more_recent, id_more_recent_or_equal, ChatMode, ClientListEntry, ClientPacket,
    DeliveryClass, ErrorReportKind, FileTransferControl, NetId, ServerCommand, ServerPacket,
    SessionId, VoteRequest,
};

use crate::banlist::{BanMatcher, BanRegistry, RangeAddress, Whitelist};
use crate::entity_sync::EntityEventSynchronizer;
use crate::error::{LoginRefusal, ServerError};
use crate::karma::{KarmaManager, Punishment};
use crate::lobby::{ClientListSync, LobbySynchronizer};
use crate::permissions::{PermissionStore, Permissions};
use crate::session::{Identity, SessionRegistry};
use crate::settings::ServerSettings;
use crate::votes::{update_kick_votes, VoteCoordinator, VoteKind};
use crate::world::GameWorld;

/// Messages delivered from the transport tasks to the tick loop.
#[derive(Debug)]
pub enum ServerEvent {
    PacketReceived {
        packet: ClientPacket,
        addr: SocketAddr,
    },
    Shutdown,
}

/// Outbound datagrams queued for the transport sender task.
#[derive(Debug)]
pub enum TransportCommand {
    Send {
        addr: SocketAddr,
        bytes: Vec<u8>,
        class: DeliveryClass,
    },
}

/// The transport collaborator: fire-and-forget per message. Reliability and
/// encryption live below this seam.
pub trait SessionTransport: Send {
    fn send(&mut self, addr: SocketAddr, bytes: Vec<u8>, class: DeliveryClass);
}

/// Transport backed by a channel to an async sender task.
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<TransportCommand>,
}

impl ChannelTransport {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }
}

impl SessionTransport for ChannelTransport {
    fn send(&mut self, addr: SocketAddr, bytes: Vec<u8>, class: DeliveryClass) {
        if let Err(err) = self.tx.send(TransportCommand::Send { addr, bytes, class }) {
            error!("Failed to queue packet for sending: {}", err);
        }
    }
}

/// Round lifecycle, advanced once per tick. Waits are deadlines, never
/// suspended routines.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundPhase {
    Lobby,
    Starting { deadline: f64 },
    Running { started_at: f64 },
    Ending { deadline: f64 },
}

/// The authoritative server core.
pub struct ServerCore<T: SessionTransport> {
    settings: ServerSettings,
    registry: SessionRegistry,
    entity_sync: EntityEventSynchronizer,
    lobby: LobbySynchronizer,
    client_list: ClientListSync,
    votes: VoteCoordinator,
    karma: KarmaManager,
    bans: BanRegistry,
    whitelist: Whitelist,
    permissions: PermissionStore,
    world: Box<dyn GameWorld>,
    transport: T,

    phase: RoundPhase,
    tick_count: u32,
    clock: f64,
    campaign_revision: NetId,
    last_mission_states: Vec<u16>,

    addr_to_session: HashMap<SocketAddr, SessionId>,
    session_to_addr: HashMap<SessionId, SocketAddr>,

    next_ping_time: f64,
    next_ping_broadcast: f64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

impl<T: SessionTransport> ServerCore<T> {
    pub fn new(settings: ServerSettings, world: Box<dyn GameWorld>, transport: T) -> Self {
        let bans = match BanRegistry::load(&settings.ban_list_path(), unix_now()) {
            Ok(bans) => bans,
            Err(err) => {
                warn!("Failed to load ban list: {}", err);
                BanRegistry::new(settings.ban_list_path())
            }
        };
        let whitelist = match Whitelist::load(&settings.whitelist_path()) {
            Ok(whitelist) => whitelist,
            Err(err) => {
                warn!("Failed to load whitelist: {}", err);
                Whitelist::new(settings.whitelist_path())
            }
        };
        let permissions = match PermissionStore::load(&settings.permission_store_path()) {
            Ok(store) => store,
            Err(err) => {
                warn!("Failed to load permission store: {}", err);
                PermissionStore::new(settings.permission_store_path())
            }
        };

        let max_players = settings.max_players;
        Self {
            settings,
            registry: SessionRegistry::new(max_players),
            entity_sync: EntityEventSynchronizer::new(),
            lobby: LobbySynchronizer::new(),
            client_list: ClientListSync::new(),
            votes: VoteCoordinator::new(),
            karma: KarmaManager::new(),
            bans,
            whitelist,
            permissions,
            world,
            transport,
            phase: RoundPhase::Lobby,
            tick_count: 0,
            clock: 0.0,
            campaign_revision: 1,
            last_mission_states: Vec::new(),
            addr_to_session: HashMap::new(),
            session_to_addr: HashMap::new(),
            next_ping_time: 0.0,
            next_ping_broadcast: 0.0,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn phase(&self) -> &RoundPhase {
        &self.phase
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn entity_sync_mut(&mut self) -> &mut EntityEventSynchronizer {
        &mut self.entity_sync
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn round_running(&self) -> bool {
        matches!(self.phase, RoundPhase::Running { .. })
    }

    /// Runs one fixed tick: drain inbound, mutate, emit outbound.
    pub fn tick(&mut self, inbound: Vec<(SocketAddr, ClientPacket)>, dt: f32) {
        self.clock += f64::from(dt);
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = self.clock;

        for (addr, packet) in inbound {
            self.dispatch(addr, packet);
        }

        for id in self
            .registry
            .check_timeouts(self.settings.session_timeout_seconds, now)
        {
            self.disconnect(id, "connection timed out", true);
        }
        self.registry
            .purge_expired_records(self.settings.recent_disconnect_retention_seconds, now);

        // moderation
        let alive: HashSet<SessionId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| self.world.is_alive(*id))
            .collect();
        let karma_outcome = self.karma.update(
            &mut self.registry,
            &self.settings.karma,
            |id| alive.contains(&id),
            dt,
            now,
        );
        for (id, karma) in karma_outcome.notices {
            self.send_to_session(id, &ServerPacket::KarmaNotice { karma }, DeliveryClass::Reliable);
            self.server_chat(Some(id), "Your standing with the crew is dangerously low.");
        }
        for action in karma_outcome.punishments {
            match action.punishment {
                Punishment::Kick => self.kick(action.session, &action.reason),
                Punishment::Ban => self.ban(
                    action.session,
                    &action.reason,
                    Some(self.settings.auto_ban_duration_seconds),
                    false,
                ),
            }
        }

        // kick votes are tallied outside the generic vote machine
        if !self.registry.is_empty() {
            let targets =
                update_kick_votes(&mut self.registry, self.settings.kick_vote_required_ratio);
            for target in targets {
                info!("audit: session {} banned by kick vote", target);
                self.ban(
                    target,
                    "kicked by vote",
                    Some(self.settings.auto_ban_duration_seconds),
                    false,
                );
            }
        }

        // the generic vote machine
        let eligible = self.registry.eligible_voters();
        if let Some(outcome) = self.votes.update(&eligible, now, &self.settings) {
            self.apply_vote_outcome(outcome);
        }

        if self.round_running() {
            let kicks = self.entity_sync.update(&self.registry, now, &self.settings);
            for kick in kicks {
                error!(
                    "Desync: disconnecting session {}: {}",
                    kick.session, kick.reason
                );
                self.kick(kick.session, &kick.reason);
            }
            for event in self.entity_sync.take_client_events() {
                self.world
                    .apply_client_event(event.sender, event.entity, &event.payload);
            }
        }

        self.update_phase();
        self.write_updates();
    }

    // ------------------------------------------------------------------
    // inbound dispatch

    fn dispatch(&mut self, addr: SocketAddr, packet: ClientPacket) {
        let session_id = self.addr_to_session.get(&addr).copied();

        let Some(id) = session_id else {
            // only login packets are meaningful before a session exists
            match packet {
                ClientPacket::Login {
                    protocol_version,
                    name,
                    account_id,
                } => self.handle_login(addr, protocol_version, name, account_id),
                other => {
                    debug!("Ignoring {:?} from sessionless {}", other, addr);
                }
            }
            return;
        };

        if let Some(session) = self.registry.get_mut(id) {
            session.touch(self.clock);
        }

        match packet {
            ClientPacket::Login {
                protocol_version,
                name,
                account_id,
            } => {
                // a fresh login over a live connection replaces the session
                info!("Session {} re-logging in from {}", id, addr);
                self.disconnect(id, "replaced by new login", false);
                self.handle_login(addr, protocol_version, name, account_id);
            }
            ClientPacket::PingResponse { nonce } => {
                let now = self.clock;
                if let Some(session) = self.registry.get_mut(id) {
                    if let Some((expected, sent_at)) = session.ping_sent_at {
                        if expected == nonce {
                            session.ping_ms = ((now - sent_at) * 1000.0).clamp(0.0, 65535.0) as u16;
                            session.ping_sent_at = None;
                        }
                    }
                }
            }
            ClientPacket::RequestStart => self.handle_request_start(id),
            ClientPacket::LobbyUpdate { acks } => {
                let revision = self.campaign_revision;
                if let Some(session) = self.registry.get_mut(id) {
                    self.lobby
                        .ack(&mut session.cursors.last_recv_lobby, acks.lobby_revision);
                    self.client_list.ack(
                        &mut session.cursors.last_recv_client_list,
                        acks.client_list_revision,
                    );
                    session.ack_chat(acks.last_recv_chat);
                    ack_campaign(
                        &mut session.cursors.last_recv_campaign,
                        acks.campaign_revision,
                        revision,
                    );
                }
            }
            ClientPacket::InGameUpdate {
                acks,
                first_event_id,
                events,
            } => {
                let revision = self.campaign_revision;
                if let Some(session) = self.registry.get_mut(id) {
                    self.entity_sync.ack(session, acks.last_recv_entity_event);
                    self.client_list.ack(
                        &mut session.cursors.last_recv_client_list,
                        acks.client_list_revision,
                    );
                    session.ack_chat(acks.last_recv_chat);
                    ack_campaign(
                        &mut session.cursors.last_recv_campaign,
                        acks.campaign_revision,
                        revision,
                    );
                    if !events.is_empty() {
                        self.entity_sync.read_client_events(
                            session,
                            first_event_id,
                            events,
                            &self.settings,
                        );
                    }
                }
            }
            ClientPacket::Chat { id: chat_id, text, mode } => {
                self.handle_chat(id, chat_id, text, mode);
            }
            ClientPacket::Command(command) => self.handle_command(id, command),
            ClientPacket::VoteStart(request) => self.handle_vote_start(id, request),
            ClientPacket::VoteCast { yes } => {
                self.votes.cast(id, yes);
            }
            ClientPacket::SettingsChange {
                name,
                message,
                properties,
                level_seed,
                hidden_subs,
            } => self.handle_settings_change(id, name, message, properties, level_seed, hidden_subs),
            ClientPacket::CampaignSetup { .. } => {
                if self.has_permission(id, Permissions::MANAGE_CAMPAIGN) {
                    self.bump_campaign_revision();
                } else {
                    warn!("Session {} sent campaign setup without permission", id);
                }
            }
            ClientPacket::Campaign(message) => self.handle_campaign_message(id, message),
            ClientPacket::Voice { data } => self.relay_voice(id, data),
            ClientPacket::ReadyCheckResponse { ready } => {
                if let Some(session) = self.registry.get_mut(id) {
                    session.ready = ready;
                }
                self.client_list.bump();
            }
            ClientPacket::ReadyToSpawn => self.handle_ready_to_spawn(id),
            ClientPacket::NameChange { name } => self.handle_name_change(id, name),
            ClientPacket::FileRequest { path } => {
                // the byte plumbing is a collaborator; the core only
                // answers the control handshake
                debug!("Session {} requested file {}", id, path);
                self.send_to_session(
                    id,
                    &ServerPacket::FileTransfer(FileTransferControl::Initiate {
                        path,
                        file_len: 0,
                    }),
                    DeliveryClass::ReliableOrdered,
                );
            }
            ClientPacket::ErrorReport {
                kind,
                last_debug_messages,
            } => self.handle_error_report(id, kind, last_debug_messages),
            ClientPacket::Disconnect { reason } => {
                self.disconnect(id, &reason, false);
            }
        }
    }

    fn handle_login(
        &mut self,
        addr: SocketAddr,
        protocol_version: u32,
        name: String,
        account_id: Option<shared::AccountId>,
    ) {
        let refusal = if protocol_version != shared::PROTOCOL_VERSION {
            Some(LoginRefusal::VersionMismatch {
                client: protocol_version,
                server: shared::PROTOCOL_VERSION,
            })
        } else if !self.whitelist.is_allowed(&name, addr.ip()) {
            Some(LoginRefusal::NotWhitelisted)
        } else {
            self.bans
                .is_banned(addr.ip(), account_id, unix_now())
                .map(LoginRefusal::Banned)
        };

        if let Some(refusal) = refusal {
            info!("Refusing login of {} from {}: {}", name, addr, refusal);
            self.send_to_addr(
                addr,
                &ServerPacket::Disconnected {
                    reason: refusal.to_string(),
                },
                DeliveryClass::Reliable,
            );
            return;
        }

        let identity = Identity {
            addr: addr.ip(),
            account_id,
        };
        let id = match self
            .registry
            .on_authenticated(identity, name.clone(), self.clock)
        {
            Ok(id) => id,
            Err(refusal) => {
                self.send_to_addr(
                    addr,
                    &ServerPacket::Disconnected {
                        reason: refusal.to_string(),
                    },
                    DeliveryClass::Reliable,
                );
                return;
            }
        };

        let stored = self
            .permissions
            .lookup(addr.ip(), account_id)
            .map(|record| (record.permissions, record.console_commands.clone()));
        if let Some(session) = self.registry.get_mut(id) {
            // the first loopback login owns the server
            if addr.ip().is_loopback() {
                session.is_owner = true;
                session.permissions = Permissions::ALL;
            }
            if let Some((permissions, console_commands)) = stored {
                session.permissions = permissions;
                session.console_commands = console_commands;
            }
        }

        self.addr_to_session.insert(addr, id);
        self.session_to_addr.insert(id, addr);
        self.client_list.bump();

        self.send_to_addr(
            addr,
            &ServerPacket::LoginAccepted {
                session_id: id,
                name,
            },
            DeliveryClass::Reliable,
        );
        let (permissions, console_commands) = self
            .registry
            .get(id)
            .map(|s| (s.permissions, s.console_commands.iter().cloned().collect()))
            .unwrap_or((Permissions::NONE, Vec::new()));
        if !permissions.is_none() {
            self.send_to_session(
                id,
                &ServerPacket::Permissions {
                    permissions: permissions.0,
                    console_commands,
                },
                DeliveryClass::Reliable,
            );
        }

        // a round in progress means the newcomer must load the level and
        // catch up on everything it missed
        if self.round_running() {
            self.send_to_session(
                id,
                &ServerPacket::StartGame {
                    level_seed: self.settings.level_seed.clone(),
                    sub: self.settings.selected_sub.clone(),
                    mode: self.settings.selected_mode.clone(),
                    respawn_allowed: true,
                },
                DeliveryClass::ReliableOrdered,
            );
        }
    }

    fn handle_chat(&mut self, id: SessionId, chat_id: NetId, text: String, mode: ChatMode) {
        let now = self.clock;
        let spam_window = self.settings.chat_spam_window_seconds;
        let spam_limit = self.settings.chat_spam_messages_per_window;
        let offense_limit = self.settings.chat_spam_offenses_before_kick;

        let (accepted, spamming, sender_name) = {
            let Some(session) = self.registry.get_mut(id) else {
                return;
            };

            // spam filter runs before sequencing so duplicates still count
            session.recent_chat_times.push_back(now);
            while session
                .recent_chat_times
                .front()
                .is_some_and(|t| now - *t > spam_window)
            {
                session.recent_chat_times.pop_front();
            }
            let spamming = session.recent_chat_times.len() > spam_limit;
            if spamming {
                session.spam_offenses += 1;
            }

            let accepted = !spamming
                && id_more_recent(chat_id, session.cursors.last_chat_from_client);
            if accepted {
                session.cursors.last_chat_from_client = chat_id;
            } else if !spamming {
                debug!(
                    "Session {} re-sent chat {} (cursor {}), rejected as stale",
                    id, chat_id, session.cursors.last_chat_from_client
                );
            }
            (accepted, spamming, session.name.clone())
        };

        if spamming {
            warn!("Session {} triggered the chat spam filter", id);
            self.karma
                .on_spam(&mut self.registry, &self.settings.karma, id, now);
            let offenses = self
                .registry
                .get(id)
                .map_or(0, |s| s.spam_offenses);
            if offenses >= offense_limit {
                self.kick(id, "chat spam");
            }
            return;
        }
        if !accepted {
            return;
        }

        for other in self.registry.ids() {
            if other == id {
                continue;
            }
            if let Some(target) = self.registry.get_mut(other) {
                target.queue_chat(Some(id), &sender_name, &text, mode);
            }
        }
    }

    fn handle_command(&mut self, id: SessionId, command: ServerCommand) {
        match command {
            ServerCommand::Kick { target, reason } => {
                if !self.has_permission(id, Permissions::KICK) {
                    warn!("Session {} tried to kick without permission", id);
                    return;
                }
                info!("audit: session {} kicked {} ({})", id, target, reason);
                self.kick(target, &reason);
            }
            ServerCommand::Ban {
                target,
                reason,
                duration_seconds,
            } => {
                if !self.has_permission(id, Permissions::BAN) {
                    warn!("Session {} tried to ban without permission", id);
                    return;
                }
                self.ban(target, &reason, duration_seconds, false);
            }
            ServerCommand::RangeBan {
                target,
                reason,
                duration_seconds,
            } => {
                if !self.has_permission(id, Permissions::BAN) {
                    warn!("Session {} tried to range-ban without permission", id);
                    return;
                }
                self.ban(target, &reason, duration_seconds, true);
            }
            ServerCommand::Unban { entry_id } => {
                if !self.has_permission(id, Permissions::UNBAN) {
                    warn!("Session {} tried to unban without permission", id);
                    return;
                }
                self.bans.unban(entry_id);
                self.bans.save_or_warn(unix_now());
            }
            ServerCommand::SetPermissions {
                target,
                permissions,
                console_commands,
            } => {
                // only the owner may hand out permissions
                if !self.registry.get(id).is_some_and(|s| s.is_owner) {
                    warn!("Session {} tried to set permissions without owning the server", id);
                    return;
                }
                self.apply_permissions(target, Permissions(permissions), console_commands);
            }
            ServerCommand::ConsoleCommand { command } => {
                let allowed = self.registry.get(id).is_some_and(|s| {
                    s.is_owner
                        || (s.permissions.contains(Permissions::CONSOLE_COMMANDS)
                            && s.console_commands.contains(
                                command.split_whitespace().next().unwrap_or_default(),
                            ))
                });
                if !allowed {
                    warn!(
                        "Session {} tried console command \"{}\" without permission",
                        id, command
                    );
                    return;
                }
                info!("audit: session {} ran console command: {}", id, command);
                if command.trim() == "enablecheats" {
                    self.broadcast(
                        &ServerPacket::CheatsEnabled { enabled: true },
                        DeliveryClass::Reliable,
                        None,
                    );
                }
            }
            ServerCommand::SelectSub { sub } => {
                if !self.has_permission(id, Permissions::SELECT_SUB) {
                    return;
                }
                self.settings.selected_sub = sub;
                self.lobby.touch(shared::LobbyFlag::Misc);
            }
            ServerCommand::SelectMode { mode } => {
                if !self.has_permission(id, Permissions::SELECT_MODE) {
                    return;
                }
                self.settings.selected_mode = mode;
                self.lobby.touch(shared::LobbyFlag::Misc);
            }
            ServerCommand::ManageRound { end } => {
                if !self.has_permission(id, Permissions::MANAGE_ROUND) {
                    warn!("Session {} tried to manage the round without permission", id);
                    return;
                }
                if end {
                    info!("audit: session {} ended the round", id);
                    self.end_round("ended by admin");
                } else {
                    info!("audit: session {} started the round", id);
                    self.start_round();
                }
            }
        }
    }

    fn handle_vote_start(&mut self, id: SessionId, request: VoteRequest) {
        if VoteKind::of(&request) == VoteKind::Kick {
            let VoteRequest::Kick { target, reason } = request else {
                return;
            };
            if target == id || self.registry.get(target).is_none() {
                return;
            }
            if self.registry.get(target).is_some_and(|s| s.is_owner) {
                self.server_chat(Some(id), "The server owner cannot be vote-kicked.");
                return;
            }
            info!(
                "audit: session {} votes to kick session {} ({})",
                id, target, reason
            );
            if let Some(target_session) = self.registry.get_mut(target) {
                target_session.kick_voters.insert(id);
            }
            return;
        }

        let result = self.votes.start(id, request, self.clock, &self.settings);
        if let Err(refusal) = result {
            self.server_chat(Some(id), &refusal.to_string());
        }
    }

    fn handle_settings_change(
        &mut self,
        id: SessionId,
        name: Option<String>,
        message: Option<String>,
        properties: Vec<(String, String)>,
        level_seed: Option<String>,
        hidden_subs: Option<Vec<String>>,
    ) {
        if !self.has_permission(id, Permissions::MANAGE_SETTINGS) {
            warn!("Session {} tried to change settings without permission", id);
            return;
        }
        if let Some(name) = name {
            self.settings.name = name;
            self.lobby.touch(shared::LobbyFlag::Name);
        }
        if let Some(message) = message {
            self.settings.message_of_the_day = message;
            self.lobby.touch(shared::LobbyFlag::Message);
        }
        if !properties.is_empty() {
            for (key, value) in properties {
                self.settings.properties.insert(key, value);
            }
            self.lobby.touch(shared::LobbyFlag::Properties);
        }
        if let Some(level_seed) = level_seed {
            self.settings.level_seed = level_seed;
            self.lobby.touch(shared::LobbyFlag::LevelSeed);
        }
        if let Some(hidden_subs) = hidden_subs {
            self.settings.hidden_subs = hidden_subs;
            self.lobby.touch(shared::LobbyFlag::HiddenSubs);
        }
    }

    fn handle_campaign_message(&mut self, id: SessionId, message: shared::protocol::CampaignMessage) {
        use shared::protocol::CampaignMessage;
        match &message {
            CampaignMessage::Money { to, amount } => {
                info!(
                    "audit: session {} transfers {} to session {}",
                    id, amount, to
                );
            }
            CampaignMessage::Crew(_) | CampaignMessage::Medical(_) => {
                debug!("Relaying campaign sub-message from session {}", id);
            }
        }
        self.bump_campaign_revision();
        // campaign payloads are opaque to the core; forward them reliably
        let packet = ServerPacket::Campaign {
            revision: self.campaign_revision,
            message,
        };
        self.broadcast(&packet, DeliveryClass::Reliable, Some(id));
    }

    fn relay_voice(&mut self, id: SessionId, data: Vec<u8>) {
        let packet = ServerPacket::Voice { from: id, data };
        for other in self.registry.ids() {
            if other == id {
                continue;
            }
            let in_game = self.registry.get(other).map_or(false, |s| s.in_game);
            if !in_game {
                continue;
            }
            self.send_to_session(other, &packet, DeliveryClass::Unreliable);
        }
    }

    fn handle_request_start(&mut self, id: SessionId) {
        if !self.has_permission(id, Permissions::MANAGE_ROUND) {
            self.server_chat(Some(id), "You do not have permission to start the round.");
            return;
        }
        info!("audit: session {} requested round start", id);
        self.start_round();
    }

    fn handle_ready_to_spawn(&mut self, id: SessionId) {
        match self.phase {
            RoundPhase::Starting { .. } | RoundPhase::Running { .. } => {}
            _ => {
                debug!("Session {} sent ready-to-spawn outside a round", id);
                return;
            }
        }
        let was_running = self.round_running();
        let now = self.clock;
        if let Some(session) = self.registry.get_mut(id) {
            if session.in_game {
                return;
            }
            session.in_game = true;
            // a late joiner missed the spawn events for everything that
            // already exists and must replay them before the live tail
            if was_running {
                self.entity_sync
                    .init_midround_sync(session, now, &self.settings);
            }
        }
        self.client_list.bump();
    }

    fn handle_name_change(&mut self, id: SessionId, name: String) {
        let trimmed = name.trim().to_string();
        if trimmed.is_empty() {
            return;
        }
        // a session others are voting to kick does not get to shed its name
        let has_kick_votes = self
            .registry
            .get(id)
            .map_or(true, |s| !s.kick_voters.is_empty());
        if has_kick_votes {
            self.server_chat(
                Some(id),
                "You cannot change your name while a kick vote against you is pending.",
            );
            return;
        }
        if let Some(session) = self.registry.get_mut(id) {
            info!("audit: session {} renamed {} -> {}", id, session.name, trimmed);
            session.name = trimmed;
        }
        self.client_list.bump();
    }

    fn handle_error_report(
        &mut self,
        id: SessionId,
        kind: ErrorReportKind,
        last_debug_messages: Vec<String>,
    ) {
        let name = self
            .registry
            .get(id)
            .map_or_else(|| "?".to_string(), |s| s.name.clone());
        error!("Session {} ({}) reported a desync: {:?}", id, name, kind);

        let diagnostic = format!(
            "[tick {}] session {} ({}) reported {:?}\n  {}\n  client debug: {:?}\n",
            self.tick_count,
            id,
            name,
            kind,
            self.entity_sync.diagnostics(),
            last_debug_messages,
        );
        let path = self.settings.error_log_path();
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(diagnostic.as_bytes()));
        if let Err(err) = written {
            warn!("Failed to write desync report to {}: {}", path.display(), err);
        }

        // the two world states can no longer be reconciled
        if self.registry.get(id).is_some_and(|s| s.is_owner) {
            self.server_chat(
                Some(id),
                "A desync was detected between the server and your client; ending the round.",
            );
            self.end_round("desync reported by the server owner");
        } else {
            self.kick(id, "desync: client and server state no longer match");
        }
    }

    // ------------------------------------------------------------------
    // votes and moderation actions

    fn apply_vote_outcome(&mut self, outcome: crate::votes::VoteOutcome) {
        if !outcome.passed {
            self.server_chat(None, "Vote failed.");
            return;
        }
        match outcome.request {
            VoteRequest::SwitchSub { sub, .. }
            | VoteRequest::PurchaseSub { sub }
            | VoteRequest::PurchaseAndSwitchSub { sub }
            | VoteRequest::SelectSub { sub } => {
                info!("audit: vote selected sub {}", sub);
                self.settings.selected_sub = sub;
                self.lobby.touch(shared::LobbyFlag::Misc);
            }
            VoteRequest::SelectMode { mode } => {
                info!("audit: vote selected mode {}", mode);
                self.settings.selected_mode = mode;
                self.lobby.touch(shared::LobbyFlag::Misc);
            }
            VoteRequest::TransferMoney { to, amount } => {
                info!("audit: vote approved transferring {} to session {}", amount, to);
                self.server_chat(None, "The crew approved the transfer.");
            }
            VoteRequest::EndRound => {
                info!("audit: round ended by vote");
                self.end_round("ended by vote");
            }
            VoteRequest::ReadyCheck => {
                self.server_chat(None, "Ready check! Confirm when you are set.");
            }
            VoteRequest::Kick { .. } => {
                // kick votes never reach the generic machine
            }
        }
    }

    fn apply_permissions(
        &mut self,
        target: SessionId,
        permissions: Permissions,
        console_commands: Vec<String>,
    ) {
        let Some(session) = self.registry.get_mut(target) else {
            warn!("Permission change for unknown session {}", target);
            return;
        };
        session.permissions = permissions;
        session.console_commands = console_commands.iter().cloned().collect();
        let name = session.name.clone();
        let key = match session.identity.account_id {
            Some(account) => crate::permissions::PermissionKey::Account(account),
            None => crate::permissions::PermissionKey::Address(session.identity.addr),
        };
        info!("audit: permissions of session {} set to {:#x}", target, permissions.0);

        self.permissions.set(
            name,
            key,
            permissions,
            console_commands.iter().cloned().collect(),
        );
        self.permissions.save_or_warn();
        self.client_list.bump();

        self.send_to_session(
            target,
            &ServerPacket::Permissions {
                permissions: permissions.0,
                console_commands,
            },
            DeliveryClass::Reliable,
        );
    }

    fn has_permission(&self, id: SessionId, permission: Permissions) -> bool {
        self.registry
            .get(id)
            .is_some_and(|s| s.is_owner || s.permissions.contains(permission))
    }

    /// Kicks a session: notice, then disconnect.
    pub fn kick(&mut self, id: SessionId, reason: &str) {
        info!("audit: kicking session {}: {}", id, reason);
        self.send_to_session(
            id,
            &ServerPacket::KickBanNotice {
                reason: reason.to_string(),
                banned: false,
            },
            DeliveryClass::Reliable,
        );
        self.disconnect(id, reason, false);
    }

    /// Bans a session's identity (account id when known, else address, or
    /// the whole address range) and disconnects it.
    pub fn ban(&mut self, id: SessionId, reason: &str, duration_seconds: Option<u64>, range: bool) {
        let Some(session) = self.registry.get(id) else {
            warn!("Ban for unknown session {}", id);
            return;
        };
        let name = session.name.clone();
        let matcher = if range {
            RangeAddress::covering(session.identity.addr)
                .map(BanMatcher::Range)
                .unwrap_or(BanMatcher::Address(session.identity.addr))
        } else {
            match session.identity.account_id {
                Some(account) => BanMatcher::Account(account),
                None => BanMatcher::Address(session.identity.addr),
            }
        };
        let expiry = duration_seconds.map(|d| unix_now() + d);
        self.bans.ban(&name, matcher, expiry, reason);
        self.bans.save_or_warn(unix_now());

        self.send_to_session(
            id,
            &ServerPacket::KickBanNotice {
                reason: reason.to_string(),
                banned: true,
            },
            DeliveryClass::Reliable,
        );
        self.disconnect(id, reason, false);
    }

    fn disconnect(&mut self, id: SessionId, reason: &str, notify: bool) {
        if notify {
            self.send_to_session(
                id,
                &ServerPacket::Disconnected {
                    reason: reason.to_string(),
                },
                DeliveryClass::Reliable,
            );
        }
        if self.registry.on_disconnect(id, reason, self.clock).is_some() {
            self.karma.on_disconnect(id);
            if let Some(addr) = self.session_to_addr.remove(&id) {
                self.addr_to_session.remove(&addr);
            }
            self.client_list.bump();
        }
    }

    // ------------------------------------------------------------------
    // round state machine

    /// Moves the lobby into the starting grace period.
    pub fn start_round(&mut self) {
        if self.phase != RoundPhase::Lobby {
            debug!("Round start requested while not in lobby");
            return;
        }
        let deadline = self.clock + self.settings.start_grace_period_seconds;
        self.phase = RoundPhase::Starting { deadline };
        self.entity_sync.on_round_start(self.clock);
        self.world.on_round_start(
            &self.settings.level_seed,
            &self.settings.selected_sub,
            &self.settings.selected_mode,
        );
        info!(
            "audit: round starting (seed {}, sub {}, mode {})",
            self.settings.level_seed, self.settings.selected_sub, self.settings.selected_mode
        );
        self.broadcast(
            &ServerPacket::StartGame {
                level_seed: self.settings.level_seed.clone(),
                sub: self.settings.selected_sub.clone(),
                mode: self.settings.selected_mode.clone(),
                respawn_allowed: true,
            },
            DeliveryClass::ReliableOrdered,
            None,
        );
    }

    /// Begins the shutdown of a running round; cleanup happens after the
    /// end-round delay so clients get the news first.
    pub fn end_round(&mut self, reason: &str) {
        match self.phase {
            RoundPhase::Running { .. } | RoundPhase::Starting { .. } => {}
            _ => return,
        }
        info!("audit: round ending: {}", reason);
        self.phase = RoundPhase::Ending {
            deadline: self.clock + self.settings.end_round_delay_seconds,
        };
        self.broadcast(
            &ServerPacket::EndGame {
                reason: reason.to_string(),
            },
            DeliveryClass::ReliableOrdered,
            None,
        );
    }

    fn update_phase(&mut self) {
        let now = self.clock;
        match self.phase.clone() {
            RoundPhase::Lobby => {}
            RoundPhase::Starting { deadline } => {
                let everyone_in = !self.registry.is_empty()
                    && self.registry.iter().all(|s| s.in_game);
                if everyone_in || now >= deadline {
                    self.phase = RoundPhase::Running { started_at: now };
                    let unique = self.entity_sync.unique_event_count() as u16;
                    self.broadcast(
                        &ServerPacket::StartGameFinalize {
                            unique_event_count: unique,
                        },
                        DeliveryClass::ReliableOrdered,
                        None,
                    );
                    if self.settings.traitors_enabled {
                        self.assign_traitor();
                    }
                    info!("audit: round running");
                }
            }
            RoundPhase::Running { .. } => {
                let states = self.world.mission_states();
                if states != self.last_mission_states {
                    self.last_mission_states = states.clone();
                    self.broadcast(
                        &ServerPacket::MissionState { states },
                        DeliveryClass::Reliable,
                        None,
                    );
                }
                if self.world.round_completed() {
                    for id in self.registry.ids() {
                        let in_game = self.registry.get(id).map_or(false, |s| s.in_game);
                        if in_game {
                            self.send_to_session(
                                id,
                                &ServerPacket::Achievement {
                                    identifier: "round_completed".to_string(),
                                },
                                DeliveryClass::Reliable,
                            );
                        }
                    }
                    self.end_round("mission completed");
                }
            }
            RoundPhase::Ending { deadline } => {
                if now >= deadline {
                    self.finish_round_cleanup();
                }
            }
        }
    }

    fn assign_traitor(&mut self) {
        let in_game: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.in_game)
            .map(|s| s.id)
            .collect();
        if in_game.is_empty() {
            return;
        }
        let chosen = in_game[rand::thread_rng().gen_range(0..in_game.len())];
        info!("audit: session {} assigned as traitor", chosen);
        self.send_to_session(
            chosen,
            &ServerPacket::TraitorMessage {
                text: "You are the traitor. Sabotage the mission without getting caught."
                    .to_string(),
            },
            DeliveryClass::ReliableOrdered,
        );
    }

    fn finish_round_cleanup(&mut self) {
        self.world.on_round_end();
        self.entity_sync.clear(&mut self.registry);
        self.karma.on_round_end(&mut self.registry, &self.settings.karma);
        self.votes.reset();
        self.last_mission_states.clear();

        // a fresh seed for the next round
        self.settings.level_seed = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect::<String>()
            .to_uppercase();
        self.lobby.touch(shared::LobbyFlag::LevelSeed);
        self.client_list.bump();
        self.phase = RoundPhase::Lobby;
        info!("audit: round over, back to lobby (next seed {})", self.settings.level_seed);
    }

    fn bump_campaign_revision(&mut self) {
        self.campaign_revision = self.campaign_revision.wrapping_add(1);
        if self.campaign_revision == 0 {
            self.campaign_revision = 1;
        }
    }

    // ------------------------------------------------------------------
    // outbound

    fn write_updates(&mut self) {
        let now = self.clock;
        let running = self.round_running();

        let list_entries: Vec<ClientListEntry> = self
            .registry
            .iter()
            .map(|s| ClientListEntry {
                session_id: s.id,
                name: s.name.clone(),
                in_game: s.in_game,
                ready: s.ready,
                has_permissions: !s.permissions.is_none(),
            })
            .collect();

        let eligible_count = self.registry.eligible_voters().len();
        let vote_status = if self.votes.dirty {
            self.votes.status(eligible_count, now, &self.settings)
        } else {
            None
        };

        for id in self.registry.ids() {
            let mut out: Vec<(ServerPacket, DeliveryClass)> = Vec::new();
            {
                let Some(session) = self.registry.get_mut(id) else {
                    continue;
                };

                if running && session.in_game {
                    out.extend(self.entity_sync.write_for_session(session, now, &self.settings));
                    let transforms = self
                        .world
                        .visible_transforms(id, self.settings.position_visibility_range);
                    if !transforms.is_empty() {
                        if let Some(packet) = self.entity_sync.write_positions(
                            session,
                            &transforms,
                            now,
                            &self.settings,
                        ) {
                            out.push((packet, DeliveryClass::Unreliable));
                        }
                    }
                }

                let chat: Vec<shared::ChatEntry> =
                    session.chat_queue.iter().take(10).cloned().collect();
                let list_due = self
                    .client_list
                    .is_due(session.cursors.last_recv_client_list);
                let client_list =
                    list_due.then(|| (self.client_list.revision(), list_entries.clone()));

                if session.in_game {
                    if !chat.is_empty() || client_list.is_some() || vote_status.is_some() {
                        out.push((
                            ServerPacket::UpdateInGame {
                                tick: self.tick_count,
                                chat,
                                client_list,
                                vote_status: vote_status.clone(),
                            },
                            DeliveryClass::Unreliable,
                        ));
                    }
                } else {
                    let delta = self
                        .lobby
                        .build_delta(session.cursors.last_recv_lobby, &self.settings);
                    if !delta.is_empty()
                        || !chat.is_empty()
                        || client_list.is_some()
                        || vote_status.is_some()
                    {
                        out.push((
                            ServerPacket::UpdateLobby {
                                revision: self.lobby.revision(),
                                settings: delta,
                                client_list,
                                chat,
                                vote_status: vote_status.clone(),
                            },
                            DeliveryClass::Unreliable,
                        ));
                    }
                }
            }
            for (packet, class) in out {
                self.send_to_session(id, &packet, class);
            }
        }
        self.votes.dirty = false;

        // keepalive pings
        if now >= self.next_ping_time {
            self.next_ping_time = now + 1.0;
            let nonce = self.tick_count;
            for id in self.registry.ids() {
                if let Some(session) = self.registry.get_mut(id) {
                    session.ping_sent_at = Some((nonce, now));
                }
                self.send_to_session(
                    id,
                    &ServerPacket::PingRequest { nonce },
                    DeliveryClass::Unreliable,
                );
            }
        }
        if now >= self.next_ping_broadcast {
            self.next_ping_broadcast = now + 5.0;
            let pings: Vec<(SessionId, u16)> =
                self.registry.iter().map(|s| (s.id, s.ping_ms)).collect();
            if !pings.is_empty() {
                self.broadcast(
                    &ServerPacket::ClientPings { pings },
                    DeliveryClass::Unreliable,
                    None,
                );
            }
        }
    }

    fn server_chat(&mut self, target: Option<SessionId>, text: &str) {
        match target {
            Some(id) => {
                if let Some(session) = self.registry.get_mut(id) {
                    session.queue_chat(None, "server", text, ChatMode::ServerMessage);
                }
            }
            None => {
                for session in self.registry.iter_mut() {
                    session.queue_chat(None, "server", text, ChatMode::ServerMessage);
                }
            }
        }
    }

    fn send_to_session(&mut self, id: SessionId, packet: &ServerPacket, class: DeliveryClass) {
        let Some(addr) = self.session_to_addr.get(&id).copied() else {
            return;
        };
        self.send_to_addr(addr, packet, class);
    }

    fn send_to_addr(&mut self, addr: SocketAddr, packet: &ServerPacket, class: DeliveryClass) {
        let bytes = match bincode::serialize(packet).map_err(ServerError::Encode) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Dropping outbound packet for {}: {}", addr, err);
                return;
            }
        };
        // a single message above the MTU is never truncated; unreliable
        // sends escalate to the reliable fragmenting path instead
        let class = if bytes.len() > self.settings.mtu && class == DeliveryClass::Unreliable {
            let session = self.addr_to_session.get(&addr).copied().unwrap_or(0);
            error!(
                "{}; escalating to reliable delivery",
                ServerError::OversizedMessage {
                    session,
                    size: bytes.len(),
                    mtu: self.settings.mtu,
                }
            );
            DeliveryClass::Reliable
        } else {
            class
        };
        self.transport.send(addr, bytes, class);
    }

    fn broadcast(&mut self, packet: &ServerPacket, class: DeliveryClass, exclude: Option<SessionId>) {
        for id in self.registry.ids() {
            if Some(id) == exclude {
                continue;
            }
            self.send_to_session(id, packet, class);
        }
    }
}

/// Campaign-revision ack: forward-only under wraparound comparison, capped
/// at the current revision.
fn ack_campaign(cursor: &mut NetId, reported: NetId, current: NetId) {
    if reported == 0 {
        return;
    }
    if id_more_recent_or_equal(reported, *cursor) && !id_more_recent(reported, current) {
        *cursor = reported;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::HeadlessWorld;
    use shared::{InGameAcks, LobbyAcks};
    use std::sync::{Arc, Mutex};

    /// Transport stub that records every outbound packet for inspection.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(SocketAddr, ServerPacket, DeliveryClass)>>>,
    }

    impl SessionTransport for RecordingTransport {
        fn send(&mut self, addr: SocketAddr, bytes: Vec<u8>, class: DeliveryClass) {
            let packet: ServerPacket = bincode::deserialize(&bytes).unwrap();
            self.sent.lock().unwrap().push((addr, packet, class));
        }
    }

    impl RecordingTransport {
        fn drain(&self) -> Vec<(SocketAddr, ServerPacket, DeliveryClass)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn sent_to(&self, addr: SocketAddr) -> Vec<ServerPacket> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _, _)| *a == addr)
                .map(|(_, p, _)| p.clone())
                .collect()
        }
    }

    fn new_core(tag: &str) -> (ServerCore<RecordingTransport>, RecordingTransport) {
        let data_dir = std::env::temp_dir().join(format!("abysswatch-core-test-{}", tag));
        std::fs::remove_dir_all(&data_dir).ok();
        std::fs::create_dir_all(&data_dir).unwrap();
        let settings = ServerSettings {
            data_dir,
            ..ServerSettings::default()
        };
        let transport = RecordingTransport::default();
        let core = ServerCore::new(
            settings,
            Box::new(HeadlessWorld::default()),
            transport.clone(),
        );
        (core, transport)
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.1.1.{}:27015", n).parse().unwrap()
    }

    fn login(core: &mut ServerCore<RecordingTransport>, addr: SocketAddr, name: &str) {
        core.tick(
            vec![(
                addr,
                ClientPacket::Login {
                    protocol_version: shared::PROTOCOL_VERSION,
                    name: name.to_string(),
                    account_id: None,
                },
            )],
            0.016,
        );
    }

    #[test]
    fn login_creates_session_and_acknowledges() {
        let (mut core, transport) = new_core("login");
        login(&mut core, addr(1), "Azimuth");

        assert_eq!(core.registry().len(), 1);
        let packets = transport.sent_to(addr(1));
        assert!(packets
            .iter()
            .any(|p| matches!(p, ServerPacket::LoginAccepted { session_id: 1, .. })));
    }

    #[test]
    fn version_mismatch_is_refused() {
        let (mut core, transport) = new_core("version");
        core.tick(
            vec![(
                addr(1),
                ClientPacket::Login {
                    protocol_version: shared::PROTOCOL_VERSION + 1,
                    name: "Old".to_string(),
                    account_id: None,
                },
            )],
            0.016,
        );
        assert_eq!(core.registry().len(), 0);
        let packets = transport.sent_to(addr(1));
        assert!(packets
            .iter()
            .any(|p| matches!(p, ServerPacket::Disconnected { .. })));
    }

    #[test]
    fn fresh_session_receives_full_lobby_state() {
        let (mut core, transport) = new_core("fresh-lobby");
        login(&mut core, addr(1), "Azimuth");
        transport.drain();

        // next tick writes the lobby update since nothing was acked yet
        core.tick(Vec::new(), 0.016);
        let packets = transport.sent_to(addr(1));
        let lobby = packets.iter().find_map(|p| match p {
            ServerPacket::UpdateLobby { settings, .. } => Some(settings.clone()),
            _ => None,
        });
        let delta = lobby.expect("expected a lobby update");
        assert!(delta.name.is_some());
        assert!(delta.level_seed.is_some());
    }

    #[test]
    fn lobby_delta_stops_after_ack() {
        let (mut core, transport) = new_core("lobby-ack");
        login(&mut core, addr(1), "Azimuth");
        core.tick(Vec::new(), 0.016);
        transport.drain();

        let revision = core.lobby.revision();
        let list_revision = core.client_list.revision();
        core.tick(
            vec![(
                addr(1),
                ClientPacket::LobbyUpdate {
                    acks: LobbyAcks {
                        lobby_revision: revision,
                        client_list_revision: list_revision,
                        last_recv_chat: 0,
                        campaign_revision: 0,
                    },
                },
            )],
            0.016,
        );
        transport.drain();

        core.tick(Vec::new(), 0.016);
        let packets = transport.sent_to(addr(1));
        assert!(!packets
            .iter()
            .any(|p| matches!(p, ServerPacket::UpdateLobby { .. })));
    }

    #[test]
    fn chat_sequencing_accepts_new_rejects_stale() {
        let (mut core, _transport) = new_core("chat-seq");
        login(&mut core, addr(1), "Azimuth");
        login(&mut core, addr(2), "Bowline");

        // the server has seen up to id 3 from this client
        core.registry_mut()
            .get_mut(1)
            .unwrap()
            .cursors
            .last_chat_from_client = 3;

        core.tick(
            vec![(
                addr(1),
                ClientPacket::Chat {
                    id: 5,
                    text: "hello".to_string(),
                    mode: ChatMode::Lobby,
                },
            )],
            0.016,
        );
        assert_eq!(
            core.registry().get(1).unwrap().cursors.last_chat_from_client,
            5
        );
        // forwarded to the other session
        assert_eq!(core.registry().get(2).unwrap().chat_queue.len(), 1);

        // a replay of id 3 is stale: cursor unchanged, nothing forwarded
        core.tick(
            vec![(
                addr(1),
                ClientPacket::Chat {
                    id: 3,
                    text: "old".to_string(),
                    mode: ChatMode::Lobby,
                },
            )],
            0.016,
        );
        assert_eq!(
            core.registry().get(1).unwrap().cursors.last_chat_from_client,
            5
        );
        assert_eq!(core.registry().get(2).unwrap().chat_queue.len(), 1);
    }

    #[test]
    fn chat_spam_escalates_to_kick() {
        let (mut core, _transport) = new_core("chat-spam");
        login(&mut core, addr(1), "Azimuth");

        let spam: Vec<(SocketAddr, ClientPacket)> = (0..200u16)
            .map(|i| {
                (
                    addr(1),
                    ClientPacket::Chat {
                        id: i + 1,
                        text: "spam".to_string(),
                        mode: ChatMode::Lobby,
                    },
                )
            })
            .collect();
        core.tick(spam, 0.016);
        // enough offenses in one burst to cross the kick threshold
        assert_eq!(core.registry().len(), 0);
    }

    #[test]
    fn permissionless_commands_are_ignored() {
        let (mut core, _transport) = new_core("no-perm");
        login(&mut core, addr(1), "Azimuth");
        login(&mut core, addr(2), "Bowline");

        core.tick(
            vec![(
                addr(1),
                ClientPacket::Command(ServerCommand::Kick {
                    target: 2,
                    reason: "bye".to_string(),
                }),
            )],
            0.016,
        );
        assert_eq!(core.registry().len(), 2);
    }

    #[test]
    fn loopback_login_owns_the_server() {
        let (mut core, _transport) = new_core("owner");
        let local: SocketAddr = "127.0.0.1:27015".parse().unwrap();
        login(&mut core, local, "Owner");
        assert!(core.registry().get(1).unwrap().is_owner);

        // the owner may start the round without stored permissions
        core.tick(vec![(local, ClientPacket::RequestStart)], 0.016);
        assert!(matches!(core.phase(), RoundPhase::Starting { .. }));
    }

    #[test]
    fn round_flow_start_to_running_to_lobby() {
        let (mut core, _transport) = new_core("round-flow");
        let local: SocketAddr = "127.0.0.1:27015".parse().unwrap();
        login(&mut core, local, "Owner");
        login(&mut core, addr(2), "Bowline");

        core.tick(vec![(local, ClientPacket::RequestStart)], 0.016);
        assert!(matches!(core.phase(), RoundPhase::Starting { .. }));

        core.tick(
            vec![
                (local, ClientPacket::ReadyToSpawn),
                (addr(2), ClientPacket::ReadyToSpawn),
            ],
            0.016,
        );
        core.tick(Vec::new(), 0.016);
        assert!(matches!(core.phase(), RoundPhase::Running { .. }));
        assert!(core.registry().get(1).unwrap().in_game);

        core.end_round("test over");
        assert!(matches!(core.phase(), RoundPhase::Ending { .. }));
        // run past the end-round delay
        for _ in 0..400 {
            core.tick(Vec::new(), 0.016);
        }
        assert_eq!(*core.phase(), RoundPhase::Lobby);
        assert!(!core.registry().get(1).unwrap().in_game);
    }

    #[test]
    fn banned_identity_cannot_rejoin() {
        let (mut core, transport) = new_core("ban-rejoin");
        login(&mut core, addr(1), "Griefer");
        core.ban(1, "testing", None, false);
        assert_eq!(core.registry().len(), 0);
        transport.drain();

        login(&mut core, addr(1), "Griefer");
        assert_eq!(core.registry().len(), 0);
        let packets = transport.sent_to(addr(1));
        assert!(packets
            .iter()
            .any(|p| matches!(p, ServerPacket::Disconnected { .. })));
    }

    #[test]
    fn timeout_disconnects_silent_session() {
        let (mut core, _transport) = new_core("timeout");
        login(&mut core, addr(1), "Azimuth");
        assert_eq!(core.registry().len(), 1);

        // advance well past the session timeout with no traffic
        for _ in 0..800 {
            core.tick(Vec::new(), 0.016);
        }
        assert_eq!(core.registry().len(), 0);
    }

    #[test]
    fn entity_events_flow_to_in_game_session() {
        let (mut core, transport) = new_core("events");
        let local: SocketAddr = "127.0.0.1:27015".parse().unwrap();
        login(&mut core, local, "Owner");
        core.tick(vec![(local, ClientPacket::RequestStart)], 0.016);
        core.tick(vec![(local, ClientPacket::ReadyToSpawn)], 0.016);
        core.tick(Vec::new(), 0.016);
        assert!(matches!(core.phase(), RoundPhase::Running { .. }));
        transport.drain();

        let now = core.clock();
        let settings = core.settings().clone();
        core.entity_sync_mut()
            .create_event(7, vec![1, 2, 3], true, true, now, &settings);
        core.tick(Vec::new(), 0.016);

        let packets = transport.sent_to(local);
        let events = packets.iter().find_map(|p| match p {
            ServerPacket::EntityEvents { events, .. } => Some(events.clone()),
            _ => None,
        });
        let events = events.expect("expected entity events");
        assert_eq!(events[0].entity, 7);

        // acking moves the cursor
        core.tick(
            vec![(
                local,
                ClientPacket::InGameUpdate {
                    acks: InGameAcks {
                        last_recv_entity_event: events[0].id,
                        client_list_revision: 0,
                        last_recv_chat: 0,
                        campaign_revision: 0,
                    },
                    first_event_id: 0,
                    events: Vec::new(),
                },
            )],
            0.016,
        );
        assert_eq!(
            core.registry().get(1).unwrap().cursors.last_recv_entity_event,
            events[0].id
        );
    }

    #[test]
    fn kick_vote_threshold_bans_target() {
        let (mut core, _transport) = new_core("kick-vote");
        for i in 1..=5u8 {
            login(&mut core, addr(i), &format!("p{}", i));
        }

        // threshold for 5 connected at 0.6 is 3
        for voter in [1u32, 2, 3] {
            let request = VoteRequest::Kick {
                target: 5,
                reason: "griefing".to_string(),
            };
            core.handle_vote_start(voter, request);
        }
        core.tick(Vec::new(), 0.016);
        assert!(core.registry().get(5).is_none());
        // the ban is recorded, not just a kick
        assert!(!core.bans.entries().is_empty());
    }
}
