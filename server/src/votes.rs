//! Vote coordination
//!
//! One vote runs at a time; later requests queue FIFO. Kick votes do not go
//! through the generic machine at all: each session accumulates a set of
//! distinct voters and is auto-banned when the set is large enough.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use shared::{SessionId, VoteRequest, VoteStatus};

use crate::error::VoteRefusal;
use crate::session::SessionRegistry;
use crate::settings::ServerSettings;

/// Vote kind discriminant, used for cooldown bookkeeping and per-kind
/// ratio/allow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteKind {
    SwitchSub,
    PurchaseSub,
    PurchaseAndSwitchSub,
    TransferMoney,
    Kick,
    EndRound,
    ReadyCheck,
    SelectSub,
    SelectMode,
}

impl VoteKind {
    pub fn of(request: &VoteRequest) -> VoteKind {
        match request {
            VoteRequest::SwitchSub { .. } => VoteKind::SwitchSub,
            VoteRequest::PurchaseSub { .. } => VoteKind::PurchaseSub,
            VoteRequest::PurchaseAndSwitchSub { .. } => VoteKind::PurchaseAndSwitchSub,
            VoteRequest::TransferMoney { .. } => VoteKind::TransferMoney,
            VoteRequest::Kick { .. } => VoteKind::Kick,
            VoteRequest::EndRound => VoteKind::EndRound,
            VoteRequest::ReadyCheck => VoteKind::ReadyCheck,
            VoteRequest::SelectSub { .. } => VoteKind::SelectSub,
            VoteRequest::SelectMode { .. } => VoteKind::SelectMode,
        }
    }
}

/// Lifecycle of the active vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    Started,
    Running,
    Passed,
    Failed,
}

#[derive(Debug)]
struct ActiveVote {
    request: VoteRequest,
    starter: SessionId,
    yes: HashSet<SessionId>,
    no: HashSet<SessionId>,
    started_at: f64,
    state: VoteState,
}

/// The single finish side effect handed back to the caller.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub request: VoteRequest,
    pub starter: SessionId,
    pub passed: bool,
}

/// Single-active-vote-plus-queue state machine.
#[derive(Debug, Default)]
pub struct VoteCoordinator {
    active: Option<ActiveVote>,
    queue: VecDeque<(SessionId, VoteRequest)>,
    /// `(starter, kind) -> server-clock instant` until which re-requests
    /// are refused.
    cooldowns: HashMap<(SessionId, VoteKind), f64>,
    /// Set when the tally changed and the status should be rebroadcast.
    pub dirty: bool,
}

impl VoteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn required_ratio(kind: VoteKind, settings: &ServerSettings) -> f32 {
        match kind {
            VoteKind::EndRound => settings.end_vote_required_ratio,
            _ => settings.vote_required_ratio,
        }
    }

    fn kind_allowed(kind: VoteKind, settings: &ServerSettings) -> bool {
        match kind {
            VoteKind::EndRound => settings.allow_end_voting,
            VoteKind::SelectSub => settings.allow_sub_voting,
            VoteKind::SelectMode => settings.allow_mode_voting,
            _ => true,
        }
    }

    /// Starts a vote or queues it behind the active one. The starter
    /// implicitly votes yes. Kick requests belong to the kick-vote tally,
    /// not this machine.
    pub fn start(
        &mut self,
        starter: SessionId,
        request: VoteRequest,
        now: f64,
        settings: &ServerSettings,
    ) -> Result<(), VoteRefusal> {
        let kind = VoteKind::of(&request);
        debug_assert!(kind != VoteKind::Kick, "kick votes are tallied per session");

        if !Self::kind_allowed(kind, settings) {
            return Err(VoteRefusal::Disabled);
        }
        if let Some(until) = self.cooldowns.get(&(starter, kind)) {
            if *until > now {
                return Err(VoteRefusal::Cooldown {
                    seconds_left: (*until - now) as f32,
                });
            }
        }

        if self.active.is_some() {
            let already_queued = self
                .queue
                .iter()
                .any(|(queued_by, queued)| *queued_by == starter && VoteKind::of(queued) == kind);
            if !already_queued {
                self.queue.push_back((starter, request));
            }
            return Ok(());
        }

        self.activate(starter, request, now);
        Ok(())
    }

    fn activate(&mut self, starter: SessionId, request: VoteRequest, now: f64) {
        info!(
            "audit: session {} started a {:?} vote",
            starter,
            VoteKind::of(&request)
        );
        let mut yes = HashSet::new();
        yes.insert(starter);
        self.active = Some(ActiveVote {
            request,
            starter,
            yes,
            no: HashSet::new(),
            started_at: now,
            state: VoteState::Started,
        });
        self.dirty = true;
    }

    /// Records a yes/no vote. The starter's yes is fixed.
    pub fn cast(&mut self, voter: SessionId, yes: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if voter == active.starter {
            return;
        }
        let changed = if yes {
            active.no.remove(&voter) | active.yes.insert(voter)
        } else {
            active.yes.remove(&voter) | active.no.insert(voter)
        };
        if changed {
            self.dirty = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Advances the active vote. Returns the finish outcome when it ends;
    /// the caller runs the side effect exactly once and resets per-session
    /// vote state.
    pub fn update(
        &mut self,
        eligible: &[SessionId],
        now: f64,
        settings: &ServerSettings,
    ) -> Option<VoteOutcome> {
        let active = self.active.as_mut()?;
        if active.state == VoteState::Started {
            active.state = VoteState::Running;
        }

        // only actively-playing sessions count
        active.yes.retain(|id| eligible.contains(id));
        active.no.retain(|id| eligible.contains(id));
        if eligible.contains(&active.starter) {
            active.yes.insert(active.starter);
        }

        let kind = VoteKind::of(&active.request);
        let ratio = Self::required_ratio(kind, settings);
        let eligible_count = eligible.len();
        let yes_count = active.yes.len();
        let no_count = active.no.len();

        let decided = if eligible_count <= 1 {
            // last voter standing: finishes early and passes
            Some(true)
        } else {
            let others = (eligible_count - 1) as f32;
            let no_fraction = no_count as f32 / others;
            let yes_fraction = yes_count as f32 / eligible_count as f32;
            if no_fraction > 1.0 - ratio {
                // passage has become impossible
                Some(false)
            } else if yes_fraction >= ratio {
                Some(true)
            } else if now - active.started_at >= f64::from(settings.vote_timeout_seconds) {
                let cast_total = (yes_count + no_count).max(1) as f32;
                Some(yes_count as f32 / cast_total >= ratio)
            } else {
                None
            }
        };

        let passed = decided?;
        let finished = self.active.take()?;
        info!(
            "audit: {:?} vote by session {} {} ({} yes / {} no of {})",
            kind,
            finished.starter,
            if passed { "passed" } else { "failed" },
            finished.yes.len(),
            finished.no.len(),
            eligible_count
        );
        if !passed {
            self.cooldowns.insert(
                (finished.starter, kind),
                now + f64::from(settings.vote_cooldown_seconds),
            );
        }
        self.dirty = true;

        if let Some((starter, request)) = self.queue.pop_front() {
            self.activate(starter, request, now);
        }

        Some(VoteOutcome {
            request: finished.request,
            starter: finished.starter,
            passed,
        })
    }

    /// Snapshot for the vote-status broadcast.
    pub fn status(
        &self,
        eligible_count: usize,
        now: f64,
        settings: &ServerSettings,
    ) -> Option<VoteStatus> {
        let active = self.active.as_ref()?;
        Some(VoteStatus {
            request: active.request.clone(),
            starter: active.starter,
            yes: active.yes.len() as u32,
            no: active.no.len() as u32,
            eligible: eligible_count as u32,
            seconds_left: (f64::from(settings.vote_timeout_seconds)
                - (now - active.started_at))
                .max(0.0) as f32,
        })
    }

    /// Round end / state reset: the active vote and the queue are dropped.
    /// Cooldowns survive so a rejected starter cannot re-spam next round.
    pub fn reset(&mut self) {
        if self.active.is_some() || !self.queue.is_empty() {
            debug!("Clearing active and queued votes");
        }
        self.active = None;
        self.queue.clear();
        self.dirty = true;
    }
}

/// Number of distinct kick voters needed before a target is auto-banned.
pub fn kick_vote_threshold(eligible_count: usize, ratio: f32) -> usize {
    2.max((eligible_count as f32 * ratio).ceil() as usize)
}

/// Tallies per-session kick votes. Voters who are no longer connected do
/// not count. Targets whose tally reaches the threshold are returned for
/// banning and their kick-vote history is cleared so an expired ban is not
/// instantly re-punished.
pub fn update_kick_votes(registry: &mut SessionRegistry, ratio: f32) -> Vec<SessionId> {
    let connected: HashSet<SessionId> = registry.ids().into_iter().collect();
    let threshold = kick_vote_threshold(connected.len(), ratio);

    let mut to_ban = Vec::new();
    for session in registry.iter_mut() {
        session.kick_voters.retain(|id| connected.contains(id));
        if session.is_owner {
            continue;
        }
        if session.kick_voters.len() >= threshold {
            to_ban.push(session.id);
            session.kick_voters.clear();
        }
    }
    to_ban
}
