//! Reputation ("karma") engine
//!
//! Every session carries a 0–100 score that drifts toward a neutral band
//! and reacts to gameplay events. Scores are derived, never logged: the
//! only history kept is a set of 60-second sliding-window trackers, so
//! memory stays bounded. Dropping below the punish threshold queues the
//! session for an automatic kick, escalating to a timed ban.

use std::collections::HashMap;

use log::{debug, info};
use shared::{EntityId, SessionId};

use crate::session::SessionRegistry;
use crate::settings::KarmaSettings;

/// Sliding-window sample used by the per-minute trackers.
#[derive(Debug, Clone, Copy)]
struct TimeAmount {
    time: f64,
    amount: f32,
}

/// Per-session rolling counters. Destroyed on disconnect; only the scalar
/// score itself survives through the session registry.
#[derive(Debug, Default)]
struct ReputationMemory {
    karma_decreases_past_minute: Vec<TimeAmount>,
    stuns_past_minute: Vec<TimeAmount>,
    stun_decrease_multiplier: f32,
    /// When a given subject last attacked this session's subject.
    last_attack_time: HashMap<EntityId, f64>,
    structure_damage_accumulator: f32,
    structure_damage_per_second: f32,
    wire_disconnects: Vec<(EntityId, f64)>,
}

impl ReputationMemory {
    fn new() -> Self {
        Self {
            stun_decrease_multiplier: 1.0,
            ..Self::default()
        }
    }

    fn structure_damage_per_second(&self) -> f32 {
        self.structure_damage_accumulator
            .max(self.structure_damage_per_second)
    }
}

/// Context for a damage/heal event, assembled by the caller from the game
/// collaborator. `is_enemy` already folds in faction hostility and any
/// adversarial side-game flag on the target.
#[derive(Debug, Clone, Copy)]
pub struct DamageContext {
    pub attacker: SessionId,
    pub attacker_subject: EntityId,
    pub target_subject: EntityId,
    pub target_session: Option<SessionId>,
    /// Positive = damage, negative = healing.
    pub damage: f32,
    pub stun: f32,
    pub is_enemy: bool,
}

/// Deterministic policy outcome of a punish-threshold crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Punishment {
    Kick,
    Ban,
}

#[derive(Debug, Clone)]
pub struct PunishAction {
    pub session: SessionId,
    pub punishment: Punishment,
    pub reason: String,
}

/// Everything one karma tick produced: punishments to carry out and
/// low-score warnings to deliver.
#[derive(Debug, Default)]
pub struct KarmaTickOutcome {
    pub punishments: Vec<PunishAction>,
    pub notices: Vec<(SessionId, f32)>,
}

/// The moderation engine itself.
#[derive(Debug)]
pub struct KarmaManager {
    memories: HashMap<SessionId, ReputationMemory>,
    next_per_second_update: f64,
}

impl KarmaManager {
    pub fn new() -> Self {
        Self {
            memories: HashMap::new(),
            next_per_second_update: 0.0,
        }
    }

    fn memory(&mut self, session: SessionId) -> &mut ReputationMemory {
        self.memories
            .entry(session)
            .or_insert_with(ReputationMemory::new)
    }

    /// Per-tick update: score drift for live subjects, window maintenance,
    /// and punish-threshold collection. A session below the threshold is
    /// queued at most once per call no matter how many penalty events
    /// landed this tick.
    pub fn update<F>(
        &mut self,
        sessions: &mut SessionRegistry,
        settings: &KarmaSettings,
        is_alive: F,
        dt: f32,
        now: f64,
    ) -> KarmaTickOutcome
    where
        F: Fn(SessionId) -> bool,
    {
        let mut outcome = KarmaTickOutcome::default();
        if !settings.enabled {
            return outcome;
        }

        let per_second_due = now >= self.next_per_second_update;
        let ids = sessions.ids();

        for id in &ids {
            let Some(session) = sessions.get_mut(*id) else {
                continue;
            };

            if is_alive(*id) {
                if session.karma > settings.decay_threshold {
                    session.karma =
                        (session.karma - settings.decay_per_second * dt).max(settings.decay_threshold);
                } else if session.karma < settings.increase_threshold {
                    session.karma = (session.karma + settings.increase_per_second * dt)
                        .min(settings.increase_threshold);
                }
            }

            // wire-disconnection spam check
            let memory = self.memory(*id);
            memory.wire_disconnects.retain(|(_, t)| now - t < 60.0);
            if memory.wire_disconnects.len() > settings.allowed_wire_disconnects_per_minute {
                memory.wire_disconnects.clear();
                let penalty = settings.wire_disconnect_decrease;
                Self::adjust(sessions, &mut self.memories, *id, -penalty, "wire spam", now);
            }

            if per_second_due {
                let memory = self.memory(*id);
                memory.structure_damage_per_second = memory.structure_damage_accumulator;
                memory.structure_damage_accumulator = 0.0;

                memory.stuns_past_minute.retain(|s| s.time + 60.0 > now);
                if memory.stuns_past_minute.is_empty() {
                    memory.stun_decrease_multiplier = 1.0;
                }

                let grace = settings.retaliation_grace_seconds;
                memory
                    .last_attack_time
                    .retain(|_, attacked_at| *attacked_at > now - grace);
            }
        }

        if per_second_due {
            self.next_per_second_update = now + 1.0;
            let warn_below = settings.kick_ban_threshold + settings.notification_band;
            for id in &ids {
                let Some(session) = sessions.get_mut(*id) else {
                    continue;
                };
                if session.last_notified_karma >= warn_below && session.karma < warn_below {
                    outcome.notices.push((*id, session.karma));
                    session.last_notified_karma = session.karma;
                    info!(
                        "audit: session {} ({}) warned for dangerously low karma ({:.1})",
                        id, session.name, session.karma
                    );
                }
            }
        }

        // collect punish-threshold crossings, once per session per tick
        for id in &ids {
            let Some(session) = sessions.get_mut(*id) else {
                continue;
            };
            if session.is_owner || session.karma >= settings.kick_ban_threshold {
                continue;
            }
            session.karma_kick_count += 1;
            if session.karma_kick_count <= settings.kicks_before_ban {
                session.karma = settings.increase_threshold.max(50.0);
                session.last_notified_karma = session.karma;
                outcome.punishments.push(PunishAction {
                    session: *id,
                    punishment: Punishment::Kick,
                    reason: format!(
                        "karma dropped below {:.0}",
                        settings.kick_ban_threshold
                    ),
                });
            } else {
                outcome.punishments.push(PunishAction {
                    session: *id,
                    punishment: Punishment::Ban,
                    reason: format!(
                        "karma dropped below {:.0} repeatedly",
                        settings.kick_ban_threshold
                    ),
                });
            }
        }

        outcome
    }

    /// Applies a damage/heal event. Retaliation within the grace window
    /// after being attacked by the same subject is exempt from penalties.
    pub fn on_damage(
        &mut self,
        sessions: &mut SessionRegistry,
        settings: &KarmaSettings,
        ctx: DamageContext,
        now: f64,
    ) {
        if !settings.enabled {
            return;
        }

        let mut damage = ctx.damage;
        let mut stun = ctx.stun;

        // remember the attack so the victim may retaliate freely
        if damage > 0.0 {
            if let Some(target) = ctx.target_session {
                self.memory(target)
                    .last_attack_time
                    .insert(ctx.attacker_subject, now);
            }
        }

        {
            let memory = self.memory(ctx.attacker);
            if let Some(attacked_at) = memory.last_attack_time.get(&ctx.target_subject) {
                if *attacked_at > now - settings.retaliation_grace_seconds {
                    damage = damage.min(0.0);
                    stun = 0.0;
                }
            }
        }

        // penalty scales with the victim's own standing
        if damage > 0.0 {
            if let Some(target) = ctx.target_session {
                if let Some(target_session) = sessions.get(target) {
                    damage *= (target_session.karma / 50.0).clamp(0.0, 1.0);
                }
            }
        }

        if ctx.is_enemy {
            if damage > 0.0 {
                let gain = damage * settings.damage_enemy_increase_per_point;
                Self::adjust(sessions, &mut self.memories, ctx.attacker, gain, "damaged enemy", now);
            }
            return;
        }

        if stun > 0.0 {
            let memory = self.memory(ctx.attacker);
            memory.stuns_past_minute.push(TimeAmount { time: now, amount: stun });

            if memory.stuns_past_minute.len() > 1 {
                let window_start = memory.stuns_past_minute[0].time;
                let span = (now - window_start).max(1.0);
                let total: f32 = memory.stuns_past_minute.iter().map(|s| s.amount).sum();
                let rate = total / span as f32;

                if rate > settings.stun_rate_threshold_per_second
                    || memory.stun_decrease_multiplier > 1.0
                {
                    let penalty = settings.stun_friendly_decrease * memory.stun_decrease_multiplier;
                    memory.stun_decrease_multiplier *= 2.0;
                    Self::adjust(
                        sessions,
                        &mut self.memories,
                        ctx.attacker,
                        -penalty,
                        "stunned friendly",
                        now,
                    );
                }
            }
        }

        if damage > 0.0 {
            let penalty = damage * settings.damage_friendly_decrease_per_point;
            Self::adjust(
                sessions,
                &mut self.memories,
                ctx.attacker,
                -penalty,
                "damaged friendly",
                now,
            );
        } else if damage < 0.0 {
            let gain = -damage * settings.heal_friendly_increase_per_point;
            Self::adjust(sessions, &mut self.memories, ctx.attacker, gain, "healed friendly", now);
        }
    }

    /// Structure damage (positive) or repair (negative). Damage penalties
    /// are capped per second through the accumulator.
    pub fn on_structure_damage(
        &mut self,
        sessions: &mut SessionRegistry,
        settings: &KarmaSettings,
        session: SessionId,
        mut amount: f32,
        now: f64,
    ) {
        if !settings.enabled {
            return;
        }
        if amount > 0.0 {
            if settings.structure_damage_decrease_per_point <= 0.0 {
                return;
            }
            let cap = settings.max_structure_damage_decrease_per_second
                / settings.structure_damage_decrease_per_point;
            let memory = self.memory(session);
            let counted = memory.structure_damage_per_second();
            memory.structure_damage_accumulator += amount;
            if counted + amount >= cap {
                amount = (cap - counted).max(0.0);
                if amount <= 0.0 {
                    return;
                }
            }
            let penalty = amount * settings.structure_damage_decrease_per_point;
            Self::adjust(
                sessions,
                &mut self.memories,
                session,
                -penalty,
                "damaged structures",
                now,
            );
        } else if amount < 0.0 {
            let gain = -amount * settings.structure_repair_increase_per_point;
            Self::adjust(sessions, &mut self.memories, session, gain, "repaired structures", now);
        }
    }

    pub fn on_item_repaired(
        &mut self,
        sessions: &mut SessionRegistry,
        settings: &KarmaSettings,
        session: SessionId,
        repair_amount: f32,
        now: f64,
    ) {
        if !settings.enabled {
            return;
        }
        let gain = repair_amount * settings.item_repair_increase;
        Self::adjust(sessions, &mut self.memories, session, gain, "repaired item", now);
    }

    pub fn on_wire_disconnected(&mut self, session: SessionId, wire: EntityId, now: f64) {
        let memory = self.memory(session);
        memory.wire_disconnects.retain(|(w, _)| *w != wire);
        memory.wire_disconnects.push((wire, now));
    }

    pub fn on_spam(
        &mut self,
        sessions: &mut SessionRegistry,
        settings: &KarmaSettings,
        session: SessionId,
        now: f64,
    ) {
        if !settings.enabled {
            return;
        }
        let penalty = settings.spam_decrease;
        Self::adjust(
            sessions,
            &mut self.memories,
            session,
            -penalty,
            "triggered the spam filter",
            now,
        );
    }

    /// Between-rounds reset: memories are dropped and every score is raised
    /// to at least the neutral floor.
    pub fn on_round_end(&mut self, sessions: &mut SessionRegistry, settings: &KarmaSettings) {
        if !settings.reset_between_rounds {
            return;
        }
        self.memories.clear();
        for session in sessions.iter_mut() {
            session.karma = session.karma.max(50.0);
            session.last_notified_karma = session.karma;
        }
    }

    pub fn on_disconnect(&mut self, session: SessionId) {
        self.memories.remove(&session);
    }

    fn adjust(
        sessions: &mut SessionRegistry,
        memories: &mut HashMap<SessionId, ReputationMemory>,
        id: SessionId,
        amount: f32,
        reason: &str,
        now: f64,
    ) {
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        session.karma = (session.karma + amount).clamp(0.0, 100.0);
        debug!(
            "karma: session {} {:+.2} ({}) -> {:.1}",
            id, amount, reason, session.karma
        );

        if amount < 0.0 {
            let memory = memories.entry(id).or_insert_with(ReputationMemory::new);
            memory
                .karma_decreases_past_minute
                .retain(|ta| ta.time + 60.0 > now);
            let aggregate: f32 = memory
                .karma_decreases_past_minute
                .iter()
                .map(|ta| ta.amount)
                .sum();
            memory.karma_decreases_past_minute.push(TimeAmount {
                time: now,
                amount: -amount,
            });
            if aggregate <= 25.0 && aggregate - amount > 25.0 {
                info!(
                    "audit: session {} lost more than 25 karma in the past minute",
                    id
                );
            }
        }
    }
}

impl Default for KarmaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Identity;
    use assert_approx_eq::assert_approx_eq;

    fn setup(count: usize) -> (SessionRegistry, KarmaManager, KarmaSettings) {
        let mut registry = SessionRegistry::new(16);
        for i in 0..count {
            registry
                .on_authenticated(
                    Identity {
                        addr: format!("10.0.0.{}", i + 1).parse().unwrap(),
                        account_id: None,
                    },
                    format!("player{}", i + 1),
                    0.0,
                )
                .unwrap();
        }
        (registry, KarmaManager::new(), KarmaSettings::default())
    }

    #[test]
    fn score_drifts_toward_neutral_band() {
        let (mut registry, mut karma, settings) = setup(1);

        // above the decay threshold: drifts down
        registry.get_mut(1).unwrap().karma = 100.0;
        karma.update(&mut registry, &settings, |_| true, 10.0, 1.0);
        assert!(registry.get(1).unwrap().karma < 100.0);

        // below the increase threshold: drifts up
        registry.get_mut(1).unwrap().karma = 10.0;
        karma.update(&mut registry, &settings, |_| true, 10.0, 2.0);
        assert!(registry.get(1).unwrap().karma > 10.0);

        // dead subjects do not drift
        registry.get_mut(1).unwrap().karma = 100.0;
        karma.update(&mut registry, &settings, |_| false, 10.0, 3.0);
        assert_approx_eq!(registry.get(1).unwrap().karma, 100.0, 0.0001);
    }

    #[test]
    fn enemy_damage_rewards_friendly_damage_penalizes() {
        let (mut registry, mut karma, settings) = setup(2);
        registry.get_mut(1).unwrap().karma = 50.0;

        karma.on_damage(
            &mut registry,
            &settings,
            DamageContext {
                attacker: 1,
                attacker_subject: 100,
                target_subject: 200,
                target_session: None,
                damage: 40.0,
                stun: 0.0,
                is_enemy: true,
            },
            1.0,
        );
        let after_enemy = registry.get(1).unwrap().karma;
        assert!(after_enemy > 50.0);

        karma.on_damage(
            &mut registry,
            &settings,
            DamageContext {
                attacker: 1,
                attacker_subject: 100,
                target_subject: 201,
                target_session: Some(2),
                damage: 40.0,
                stun: 0.0,
                is_enemy: false,
            },
            2.0,
        );
        assert!(registry.get(1).unwrap().karma < after_enemy);
    }

    #[test]
    fn retaliation_within_grace_window_is_exempt() {
        let (mut registry, mut karma, settings) = setup(2);
        registry.get_mut(1).unwrap().karma = 50.0;
        registry.get_mut(2).unwrap().karma = 50.0;

        // session 2's subject (201) attacks session 1's subject (101)
        karma.on_damage(
            &mut registry,
            &settings,
            DamageContext {
                attacker: 2,
                attacker_subject: 201,
                target_subject: 101,
                target_session: Some(1),
                damage: 10.0,
                stun: 0.0,
                is_enemy: false,
            },
            1.0,
        );

        // session 1 hits back within the grace window: no penalty
        let before = registry.get(1).unwrap().karma;
        karma.on_damage(
            &mut registry,
            &settings,
            DamageContext {
                attacker: 1,
                attacker_subject: 101,
                target_subject: 201,
                target_session: Some(2),
                damage: 25.0,
                stun: 1.0,
                is_enemy: false,
            },
            2.0,
        );
        assert_approx_eq!(registry.get(1).unwrap().karma, before, 0.0001);

        // well past the grace window the same hit is penalized
        karma.on_damage(
            &mut registry,
            &settings,
            DamageContext {
                attacker: 1,
                attacker_subject: 101,
                target_subject: 201,
                target_session: Some(2),
                damage: 25.0,
                stun: 0.0,
                is_enemy: false,
            },
            2.0 + settings.retaliation_grace_seconds + 60.0,
        );
        assert!(registry.get(1).unwrap().karma < before);
    }

    #[test]
    fn repeated_friendly_stuns_escalate() {
        let (mut registry, mut karma, settings) = setup(2);
        registry.get_mut(1).unwrap().karma = 90.0;

        let mut drops = Vec::new();
        let mut previous = 90.0f32;
        for i in 0..4 {
            karma.on_damage(
                &mut registry,
                &settings,
                DamageContext {
                    attacker: 1,
                    attacker_subject: 101,
                    target_subject: 202,
                    target_session: Some(2),
                    damage: 0.0,
                    stun: 5.0,
                    is_enemy: false,
                },
                1.0 + f64::from(i),
            );
            let current = registry.get(1).unwrap().karma;
            drops.push(previous - current);
            previous = current;
        }

        // first stun alone never triggers; later penalties double each time
        assert_approx_eq!(drops[0], 0.0, 0.0001);
        assert!(drops[2] > drops[1]);
        assert!(drops[3] > drops[2]);
    }

    #[test]
    fn punish_queued_once_per_tick_then_escalates_to_ban() {
        let (mut registry, mut karma, mut settings) = setup(1);
        settings.kicks_before_ban = 2;

        registry.get_mut(1).unwrap().karma = 0.5;
        let outcome = karma.update(&mut registry, &settings, |_| true, 0.016, 1.0);
        assert_eq!(outcome.punishments.len(), 1);
        assert_eq!(outcome.punishments[0].punishment, Punishment::Kick);
        // score reset to the neutral floor
        assert!(registry.get(1).unwrap().karma >= 50.0);

        registry.get_mut(1).unwrap().karma = 0.5;
        let outcome = karma.update(&mut registry, &settings, |_| true, 0.016, 2.0);
        assert_eq!(outcome.punishments[0].punishment, Punishment::Kick);

        registry.get_mut(1).unwrap().karma = 0.5;
        let outcome = karma.update(&mut registry, &settings, |_| true, 0.016, 3.0);
        assert_eq!(outcome.punishments[0].punishment, Punishment::Ban);
    }

    #[test]
    fn owner_is_exempt_from_punishment() {
        let (mut registry, mut karma, settings) = setup(1);
        let session = registry.get_mut(1).unwrap();
        session.is_owner = true;
        session.karma = 0.0;

        let outcome = karma.update(&mut registry, &settings, |_| true, 0.016, 1.0);
        assert!(outcome.punishments.is_empty());
    }

    #[test]
    fn structure_damage_is_capped_per_second() {
        let (mut registry, mut karma, settings) = setup(1);
        registry.get_mut(1).unwrap().karma = 100.0;

        // hammering structures in a single second only counts up to the cap
        for _ in 0..50 {
            karma.on_structure_damage(&mut registry, &settings, 1, 100.0, 1.0);
        }
        let lost = 100.0 - registry.get(1).unwrap().karma;
        assert!(lost <= settings.max_structure_damage_decrease_per_second + 0.001);
    }

    #[test]
    fn wire_spam_penalized_after_allowance() {
        let (mut registry, mut karma, settings) = setup(1);
        registry.get_mut(1).unwrap().karma = 80.0;

        for wire in 0..(settings.allowed_wire_disconnects_per_minute as u16 + 2) {
            karma.on_wire_disconnected(1, 1000 + wire, 1.0);
        }
        karma.update(&mut registry, &settings, |_| true, 0.016, 2.0);
        assert!(registry.get(1).unwrap().karma < 80.0);
    }

    #[test]
    fn low_karma_notice_sent_once_per_crossing() {
        let (mut registry, mut karma, settings) = setup(1);
        registry.get_mut(1).unwrap().karma = 10.0;

        let outcome = karma.update(&mut registry, &settings, |_| false, 0.016, 1.0);
        assert_eq!(outcome.notices.len(), 1);

        // staying low does not repeat the warning
        let outcome = karma.update(&mut registry, &settings, |_| false, 0.016, 2.5);
        assert!(outcome.notices.is_empty());
    }

    #[test]
    fn round_end_resets_memories_and_raises_floor() {
        let (mut registry, mut karma, settings) = setup(2);
        registry.get_mut(1).unwrap().karma = 20.0;
        registry.get_mut(2).unwrap().karma = 80.0;

        karma.on_round_end(&mut registry, &settings);
        assert_approx_eq!(registry.get(1).unwrap().karma, 50.0, 0.0001);
        assert_approx_eq!(registry.get(2).unwrap().karma, 80.0, 0.0001);
    }
}
