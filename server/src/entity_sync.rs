//! Entity-event synchronization
//!
//! Every entity-affecting event is appended to a global ordered log with a
//! wraparound 16-bit id. Sessions never hold copies, only read cursors;
//! each tick the synchronizer writes the events a session hasn't
//! acknowledged yet, in ascending id order, packed under the MTU. A second
//! unique-event log records one event per entity spawn for the whole round
//! so late joiners can catch up without replaying all gameplay events. A
//! parallel lossy lane re-sends entity transforms with no ordering or
//! acknowledgement at all.

use std::collections::VecDeque;

use log::{debug, error, info, warn};
use shared::{
    id_after, id_before, id_more_recent, id_more_recent_or_equal, DeliveryClass, EntityId,
    EntityTransform, NetId, ServerPacket, SessionId, WireEntityEvent, PACKET_FRAMING_RESERVE,
};

use crate::session::{ClientSession, MidRoundSync, SessionRegistry};
use crate::settings::ServerSettings;

/// Hard cap on the live log; beyond this the oldest events are dropped
/// regardless of acknowledgement state and stragglers are desync-kicked.
const MAX_LIVE_EVENTS: usize = 4096;

/// Live log entries older than the last delivered-to-anyone event by this
/// many seconds get the laggards kicked rather than blocking the server.
const LAG_WARNING_INTERVAL: f64 = 5.0;

/// One event in the global log.
#[derive(Debug, Clone)]
struct EntityEvent {
    id: NetId,
    entity: EntityId,
    payload: Vec<u8>,
    created_at: f64,
    sent: bool,
}

impl EntityEvent {
    fn is_duplicate_of(&self, entity: EntityId, payload: &[u8]) -> bool {
        self.entity == entity && self.payload == payload
    }

    fn to_wire(&self) -> WireEntityEvent {
        WireEntityEvent {
            id: self.id,
            entity: self.entity,
            payload: self.payload.clone(),
        }
    }
}

/// A client-originated event accepted in order, awaiting processing by the
/// game collaborator.
#[derive(Debug)]
pub struct BufferedClientEvent {
    pub sender: SessionId,
    pub entity: EntityId,
    pub payload: Vec<u8>,
}

/// A session the synchronizer decided to disconnect this tick, with the
/// diagnostic reason already formatted.
#[derive(Debug)]
pub struct SyncKick {
    pub session: SessionId,
    pub reason: String,
}

/// The per-round event log plus the bookkeeping needed to prune it safely.
#[derive(Debug)]
pub struct EntityEventSynchronizer {
    events: VecDeque<EntityEvent>,
    /// One entry per unique entity spawn, numbered 1..=n in its own id
    /// space, kept for the whole round for mid-join catch-up.
    unique_events: Vec<EntityEvent>,
    last_id: NetId,
    last_sent_to_all: NetId,
    last_sent_to_anyone: NetId,
    last_sent_to_anyone_time: f64,
    last_lag_warning_time: f64,
    round_start_time: f64,
    buffered: Vec<BufferedClientEvent>,
}

impl EntityEventSynchronizer {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            unique_events: Vec::new(),
            last_id: 0,
            last_sent_to_all: 0,
            last_sent_to_anyone: 0,
            last_sent_to_anyone_time: 0.0,
            last_lag_warning_time: -LAG_WARNING_INTERVAL,
            round_start_time: 0.0,
            buffered: Vec::new(),
        }
    }

    pub fn on_round_start(&mut self, now: f64) {
        self.clear_internal();
        self.round_start_time = now;
    }

    /// Number of unique entity-spawning events so far this round.
    pub fn unique_event_count(&self) -> usize {
        self.unique_events.len()
    }

    pub fn live_event_count(&self) -> usize {
        self.events.len()
    }

    pub fn last_event_id(&self) -> NetId {
        self.last_id
    }

    /// Appends a new event to the log. No session is blocked by this call.
    /// Returns the assigned id, or `None` when an identical unsent event
    /// already covers it.
    pub fn create_event(
        &mut self,
        entity: EntityId,
        payload: Vec<u8>,
        unique_spawn: bool,
        in_game_clients_present: bool,
        now: f64,
        settings: &ServerSettings,
    ) -> Option<NetId> {
        // prune events everyone has: keep the last acknowledged one so it
        // still anchors the id sequence, and keep recent events around long
        // enough for a quick reconnect
        if now > self.round_start_time + settings.round_start_sync_duration_seconds {
            let last_sent_to_all = self.last_sent_to_all;
            let retention = settings.event_retention_seconds;
            self.events.retain(|e| {
                let delivered = id_more_recent(last_sent_to_all, e.id) || !in_game_clients_present;
                !(delivered && e.created_at < now - retention)
            });
        }

        // an identical event still waiting to be sent makes this one
        // redundant
        if self
            .events
            .iter()
            .rev()
            .any(|e| !e.sent && e.is_duplicate_of(entity, &payload))
        {
            return None;
        }

        self.last_id = id_after(self.last_id);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        let id = self.last_id;
        self.events.push_back(EntityEvent {
            id,
            entity,
            payload: payload.clone(),
            created_at: now,
            sent: false,
        });

        // hard cap: drop the oldest regardless of acknowledgement state
        while self.events.len() > MAX_LIVE_EVENTS {
            let dropped = self.events.pop_front();
            if let Some(dropped) = dropped {
                debug!(
                    "Event log over capacity, dropped event {} for entity {}",
                    dropped.id, dropped.entity
                );
            }
        }

        if unique_spawn
            && !self
                .unique_events
                .iter()
                .any(|e| e.is_duplicate_of(entity, &payload))
        {
            let unique_id = (self.unique_events.len() + 1) as NetId;
            self.unique_events.push(EntityEvent {
                id: unique_id,
                entity,
                payload,
                created_at: now,
                sent: false,
            });
        }

        Some(id)
    }

    /// Per-tick bookkeeping: advances the slowest/fastest delivery cursors,
    /// emits the lag warning, and collects sessions that must be
    /// disconnected because the log can no longer serve them.
    pub fn update(
        &mut self,
        registry: &SessionRegistry,
        now: f64,
        settings: &ServerSettings,
    ) -> Vec<SyncKick> {
        let mut kicks = Vec::new();

        let in_game: Vec<&ClientSession> = registry
            .iter()
            .filter(|s| s.in_game && !s.needs_midround_sync())
            .collect();

        if !in_game.is_empty() {
            let mut last_to_all = in_game[0].cursors.last_recv_entity_event;
            let mut last_to_anyone = last_to_all;
            if let Some(owner) = in_game.iter().find(|s| s.is_owner) {
                last_to_all = owner.cursors.last_recv_entity_event;
            }
            for session in &in_game {
                let acked = session.cursors.last_recv_entity_event;
                if id_more_recent(last_to_all, acked) {
                    last_to_all = acked;
                }
                if id_more_recent(acked, last_to_anyone) {
                    last_to_anyone = acked;
                }
            }
            self.last_sent_to_anyone = last_to_anyone;
            self.last_sent_to_anyone_time = self
                .events
                .iter()
                .find(|e| e.id == last_to_anyone)
                .map_or(now, |e| e.created_at);

            // catch-up sessions pin the prune cursor to just before their
            // first live event so nothing they still need disappears
            for session in registry.iter().filter(|s| s.needs_midround_sync()) {
                if let Some(sync) = &session.midround_sync {
                    if id_more_recent(last_to_all, sync.first_new_event_id) {
                        last_to_all = id_before(sync.first_new_event_id);
                    }
                }
            }
            self.last_sent_to_all = last_to_all;

            let past_grace =
                now > self.round_start_time + settings.round_start_sync_duration_seconds;
            if past_grace
                && id_more_recent(self.last_id, self.last_sent_to_anyone)
                && now - self.last_lag_warning_time > LAG_WARNING_INTERVAL
                && now - self.last_sent_to_anyone_time > settings.old_event_kick_seconds
            {
                self.last_lag_warning_time = now;
                warn!(
                    "Entity event delivery is lagging behind (last delivered id {}, latest id {})",
                    self.last_sent_to_anyone, self.last_id
                );
                for event in self.events.iter_mut() {
                    event.created_at = now;
                }
            }

            // sessions stuck waiting for an event far older than what the
            // rest of the server has long since received
            let next_needed = id_after(self.last_sent_to_all);
            if let Some(first_unacked) = self.events.iter().find(|e| e.id == next_needed) {
                let stale_vs_anyone =
                    self.last_sent_to_anyone_time - first_unacked.created_at
                        > settings.old_event_kick_seconds;
                let stale_vs_now =
                    now - first_unacked.created_at > settings.old_event_kick_seconds * 2.0;
                if past_grace && (stale_vs_anyone || stale_vs_now) {
                    for session in &in_game {
                        if session.is_owner {
                            continue;
                        }
                        if id_more_recent(
                            next_needed,
                            session.cursors.last_recv_entity_event,
                        ) {
                            kicks.push(SyncKick {
                                session: session.id,
                                reason: format!(
                                    "expecting a very old entity event ({}, latest is {})",
                                    id_after(session.cursors.last_recv_entity_event),
                                    self.last_id
                                ),
                            });
                        }
                    }
                }
            }

            // sessions expecting an event that was pruned from the log
            if let Some(oldest) = self.events.front() {
                for session in &in_game {
                    if session.is_owner {
                        continue;
                    }
                    let expecting = id_after(session.cursors.last_recv_entity_event);
                    if id_more_recent(oldest.id, expecting) {
                        kicks.push(SyncKick {
                            session: session.id,
                            reason: format!(
                                "expecting removed entity event {} (oldest available is {})",
                                expecting, oldest.id
                            ),
                        });
                    }
                }
            }
        }

        // catch-up sessions that never finished in time
        for session in registry.iter() {
            if session.is_owner {
                continue;
            }
            if let Some(sync) = &session.midround_sync {
                if now > sync.deadline {
                    kicks.push(SyncKick {
                        session: session.id,
                        reason: "mid-round sync took too long".to_string(),
                    });
                }
            }
        }

        kicks.sort_by_key(|k| k.session);
        kicks.dedup_by_key(|k| k.session);
        kicks
    }

    /// Marks a freshly joined session for mid-round catch-up: it must
    /// replay exactly the unique spawn events it missed before switching to
    /// the live tail. The timeout scales with how much there is to replay.
    pub fn init_midround_sync(
        &self,
        session: &mut ClientSession,
        now: f64,
        settings: &ServerSettings,
    ) {
        let no_catchup_needed = self.unique_events.is_empty()
            || self
                .events
                .front()
                .is_some_and(|first| first.id == self.unique_events[0].id);
        if no_catchup_needed {
            session.midround_sync = None;
            return;
        }

        let unreceived = self.unique_events.len() as u16;
        let update_interval = f64::from(settings.update_interval_seconds);
        let timeout = (f64::from(unreceived) / 100.0 * update_interval * 10.0).max(10.0);
        session.midround_sync = Some(MidRoundSync {
            unreceived_count: unreceived,
            first_new_event_id: id_after(self.last_id),
            deadline: now + timeout,
        });
        session.cursors.last_recv_entity_event = 0;
        info!(
            "Session {} needs mid-round sync: {} unique event(s), {:.0}s deadline",
            session.id, unreceived, timeout
        );
    }

    /// Serializes the events the session hasn't acknowledged yet into as
    /// many packets as fit this tick. Packing never exceeds the MTU; an
    /// oversized single event escalates to the reliable fragmenting path
    /// instead of being truncated.
    pub fn write_for_session(
        &mut self,
        session: &mut ClientSession,
        now: f64,
        settings: &ServerSettings,
    ) -> Vec<(ServerPacket, DeliveryClass)> {
        let syncing = session.needs_midround_sync();
        let acked = session.cursors.last_recv_entity_event;
        let midround_header = session
            .midround_sync
            .as_ref()
            .map(|s| (s.unreceived_count, s.first_new_event_id));

        // spawns that happen after the join arrive through the live tail,
        // so catch-up only ever serves the events the session missed
        let list: Vec<&EntityEvent> = if syncing {
            let missed = session
                .midround_sync
                .map_or(usize::MAX, |s| usize::from(s.unreceived_count));
            self.unique_events.iter().take(missed).collect()
        } else {
            self.events.iter().collect()
        };
        if list.is_empty() {
            return Vec::new();
        }

        // first event the session hasn't acknowledged
        let mut start = list.len();
        while start > 0 && id_more_recent(list[start - 1].id, acked) {
            start -= 1;
        }

        // resend backoff: skip events sent again within roughly one
        // round-trip
        let min_interval = f64::from(session.ping_ms).max(10.0) / 1000.0;
        let min_interval =
            min_interval.max(f64::from(settings.update_interval_seconds) * 2.0).min(0.5);
        while start < list.len() {
            let last_sent = session
                .event_last_sent
                .get(&list[start].id)
                .copied()
                .unwrap_or(f64::MIN);
            if last_sent <= now - min_interval {
                break;
            }
            start += 1;
        }
        if start >= list.len() {
            return Vec::new();
        }

        let budget = settings.mtu.saturating_sub(PACKET_FRAMING_RESERVE);
        let mut packets: Vec<(ServerPacket, DeliveryClass)> = Vec::new();
        let mut batch: Vec<WireEntityEvent> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut newest_written = session.cursors.last_sent_entity_event;

        for event in &list[start..] {
            let wire = event.to_wire();
            let size = match bincode::serialized_size(&wire) {
                Ok(size) => size as usize,
                Err(err) => {
                    error!("Failed to measure entity event {}: {}", event.id, err);
                    continue;
                }
            };

            if size > budget {
                if syncing {
                    // initial payloads may exceed the MTU; the reliable
                    // path fragments them
                    error!(
                        "Entity event {} for session {} exceeds the packet budget \
                         ({} > {} bytes), escalating to reliable delivery",
                        event.id, session.id, size, budget
                    );
                    packets.push((
                        ServerPacket::EntityEvents {
                            midround: midround_header,
                            events: vec![wire],
                        },
                        DeliveryClass::Reliable,
                    ));
                    session.event_last_sent.insert(event.id, now);
                    newest_written = event.id;
                    continue;
                }
                error!(
                    "Entity event {} for entity {} exceeds the packet budget \
                     ({} > {} bytes), dropping from steady-state sync",
                    event.id, event.entity, size, budget
                );
                session.event_last_sent.insert(event.id, now);
                continue;
            }

            if batch_bytes + size > budget && !batch.is_empty() {
                packets.push((
                    ServerPacket::EntityEvents {
                        midround: midround_header,
                        events: std::mem::take(&mut batch),
                    },
                    DeliveryClass::Unreliable,
                ));
                batch_bytes = 0;
                if packets.len() >= settings.max_event_packets_per_tick {
                    break;
                }
            }

            batch_bytes += size;
            session.event_last_sent.insert(event.id, now);
            newest_written = event.id;
            batch.push(wire);
        }

        if !batch.is_empty() && packets.len() < settings.max_event_packets_per_tick {
            packets.push((
                ServerPacket::EntityEvents {
                    midround: midround_header,
                    events: batch,
                },
                DeliveryClass::Unreliable,
            ));
        }

        if !packets.is_empty() {
            session.cursors.last_sent_entity_event = newest_written;
            if !syncing {
                let sent_ids: Vec<NetId> = packets
                    .iter()
                    .flat_map(|(packet, _)| match packet {
                        ServerPacket::EntityEvents { events, .. } => {
                            events.iter().map(|e| e.id).collect::<Vec<_>>()
                        }
                        _ => Vec::new(),
                    })
                    .collect();
                for event in self.events.iter_mut() {
                    if sent_ids.contains(&event.id) {
                        event.sent = true;
                    }
                }
            }
        }
        packets
    }

    /// Handles a session's entity-event acknowledgement. The cursor only
    /// ever moves forward under wraparound comparison; stale reports are
    /// logged and ignored. While the session is in mid-round catch-up the
    /// ack counts unique events and decides when catch-up is complete.
    pub fn ack(&mut self, session: &mut ClientSession, reported: NetId) {
        if let Some(sync) = session.midround_sync {
            let unique_count = self.unique_events.len() as NetId;
            let cursor = session.cursors.last_recv_entity_event;
            if id_more_recent_or_equal(reported, cursor) && reported <= unique_count {
                session.cursors.last_recv_entity_event = reported;
            } else if reported != cursor {
                debug!(
                    "Session {} reported stale catch-up ack {} (cursor {})",
                    session.id, reported, cursor
                );
            }

            let backlog_done = sync.unreceived_count == 0
                || session.cursors.last_recv_entity_event >= sync.unreceived_count;
            if backlog_done {
                session.midround_sync = None;
                session.cursors.last_recv_entity_event = id_before(sync.first_new_event_id);
                session.event_last_sent.clear();
                info!("Session {} finished mid-round sync", session.id);
            }
            return;
        }

        let cursor = session.cursors.last_recv_entity_event;
        if id_more_recent_or_equal(reported, cursor) && !id_more_recent(reported, self.last_id)
        {
            session.cursors.last_recv_entity_event = reported;
        } else if reported != cursor {
            debug!(
                "Session {} reported stale entity event ack {} (cursor {}, latest {})",
                session.id, reported, cursor, self.last_id
            );
        }
    }

    /// Accepts client-originated events in strict sequence order, buffering
    /// them for the game collaborator. Ids out of order are skipped; the
    /// buffer is capped so a spamming client cannot grow it without bound.
    pub fn read_client_events(
        &mut self,
        session: &mut ClientSession,
        first_event_id: NetId,
        events: Vec<WireEntityEvent>,
        settings: &ServerSettings,
    ) {
        for (index, event) in events.into_iter().enumerate() {
            let this_id = first_event_id.wrapping_add(index as NetId);
            if this_id != id_after(session.cursors.last_client_event) {
                debug!(
                    "Session {} sent event {} while {} was expected",
                    session.id,
                    this_id,
                    id_after(session.cursors.last_client_event)
                );
                continue;
            }
            session.cursors.last_client_event = this_id;

            if self.buffered.len() >= settings.max_buffered_client_events {
                warn!(
                    "Client event buffer over capacity, dropping oldest {} event(s)",
                    settings.max_buffered_client_events / 2
                );
                self.buffered.drain(..settings.max_buffered_client_events / 2);
            }
            self.buffered.push(BufferedClientEvent {
                sender: session.id,
                entity: event.entity,
                payload: event.payload,
            });
        }
    }

    /// Hands the buffered client events to the caller for processing.
    pub fn take_client_events(&mut self) -> Vec<BufferedClientEvent> {
        std::mem::take(&mut self.buffered)
    }

    /// Builds the lossy position-lane payload for one session: the latest
    /// transform of each visible entity, deduplicated per send interval.
    /// A future-dated "last sent" stamp means the clock went backwards;
    /// the entry is dropped and re-primed rather than trusted.
    pub fn write_positions(
        &self,
        session: &mut ClientSession,
        visible: &[EntityTransform],
        now: f64,
        settings: &ServerSettings,
    ) -> Option<ServerPacket> {
        let budget = settings.mtu.saturating_sub(PACKET_FRAMING_RESERVE);
        let per_entry = bincode::serialized_size(&EntityTransform {
            entity: 0,
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
        })
        .ok()? as usize;
        let max_entries = (budget / per_entry).max(1);

        let mut transforms = Vec::new();
        for transform in visible {
            if transforms.len() >= max_entries {
                break;
            }
            match session.position_last_sent.get(&transform.entity) {
                Some(last) if *last > now => {
                    warn!(
                        "Future-dated position stamp for entity {} (session {}), dropping",
                        transform.entity, session.id
                    );
                    session.position_last_sent.remove(&transform.entity);
                    continue;
                }
                Some(last)
                    if now - *last < settings.position_update_interval_seconds =>
                {
                    continue;
                }
                _ => {}
            }
            session.position_last_sent.insert(transform.entity, now);
            transforms.push(*transform);
        }

        if transforms.is_empty() {
            None
        } else {
            Some(ServerPacket::Positions { transforms })
        }
    }

    /// Diagnostic summary written to the desync error log.
    pub fn diagnostics(&self) -> String {
        format!(
            "live events: {} (ids {}..={}), unique spawn events: {}, last sent to all: {}, \
             last sent to anyone: {}",
            self.events.len(),
            self.events.front().map_or(0, |e| e.id),
            self.last_id,
            self.unique_events.len(),
            self.last_sent_to_all,
            self.last_sent_to_anyone
        )
    }

    fn clear_internal(&mut self) {
        self.events.clear();
        self.unique_events.clear();
        self.buffered.clear();
        self.last_id = 0;
        self.last_sent_to_all = 0;
        self.last_sent_to_anyone = 0;
        self.last_sent_to_anyone_time = 0.0;
    }

    /// Round end: the log is dropped and every session's event cursors are
    /// reset alongside their per-round scratch maps.
    pub fn clear(&mut self, registry: &mut SessionRegistry) {
        self.clear_internal();
        for session in registry.iter_mut() {
            session.reset_round_state();
        }
    }
}

impl Default for EntityEventSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}
