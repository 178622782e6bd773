//! Server-wide configuration
//!
//! The core receives an already-parsed [`ServerSettings`]; how it gets
//! populated (config file, CLI, admin UI) is the caller's concern. The
//! numeric values here are tuning constants, not structural: correctness
//! only depends on the monotonicity of the thresholds.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything the server core needs to know about how the operator wants it
/// to behave. Lobby-synced fields are propagated to clients through the
/// dirty-flag synchronizer; the rest are server-side policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    // Lobby-visible configuration
    pub name: String,
    pub message_of_the_day: String,
    pub properties: BTreeMap<String, String>,
    pub level_seed: String,
    pub selected_sub: String,
    pub selected_mode: String,
    pub mission_type: String,
    pub traitors_enabled: bool,
    pub hidden_subs: Vec<String>,

    // Capacity and timing
    pub max_players: usize,
    pub update_interval_seconds: f32,
    pub session_timeout_seconds: f32,
    pub recent_disconnect_retention_seconds: f64,
    pub start_grace_period_seconds: f64,
    pub end_round_delay_seconds: f64,

    // Packet budgets
    pub mtu: usize,
    pub max_event_packets_per_tick: usize,
    pub position_update_interval_seconds: f64,
    pub position_visibility_range: f32,

    // Entity event log policy
    pub event_retention_seconds: f64,
    pub old_event_kick_seconds: f64,
    pub round_start_sync_duration_seconds: f64,
    pub max_buffered_client_events: usize,

    // Voting
    pub vote_timeout_seconds: f32,
    pub vote_required_ratio: f32,
    pub end_vote_required_ratio: f32,
    pub kick_vote_required_ratio: f32,
    pub vote_cooldown_seconds: f32,
    pub allow_end_voting: bool,
    pub allow_sub_voting: bool,
    pub allow_mode_voting: bool,

    // Moderation
    pub auto_ban_duration_seconds: u64,
    pub chat_spam_offenses_before_kick: u32,
    pub chat_spam_window_seconds: f64,
    pub chat_spam_messages_per_window: usize,
    pub karma: KarmaSettings,

    // Persistence
    pub data_dir: PathBuf,
}

impl ServerSettings {
    pub fn ban_list_path(&self) -> PathBuf {
        self.data_dir.join("banlist.txt")
    }

    pub fn whitelist_path(&self) -> PathBuf {
        self.data_dir.join("whitelist.txt")
    }

    pub fn permission_store_path(&self) -> PathBuf {
        self.data_dir.join("permissions.json")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.data_dir.join("desync_errors.log")
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Abysswatch Server".to_string(),
            message_of_the_day: String::new(),
            properties: BTreeMap::new(),
            level_seed: "AAAAAA".to_string(),
            selected_sub: "Kestrel".to_string(),
            selected_mode: "mission".to_string(),
            mission_type: "random".to_string(),
            traitors_enabled: false,
            hidden_subs: Vec::new(),

            max_players: 16,
            update_interval_seconds: 1.0 / 20.0,
            session_timeout_seconds: 10.0,
            recent_disconnect_retention_seconds: 600.0,
            start_grace_period_seconds: 30.0,
            end_round_delay_seconds: 5.0,

            mtu: shared::DEFAULT_MTU,
            max_event_packets_per_tick: 4,
            position_update_interval_seconds: 0.25,
            position_visibility_range: 1000.0,

            event_retention_seconds: 15.0,
            old_event_kick_seconds: 10.0,
            round_start_sync_duration_seconds: 10.0,
            max_buffered_client_events: 512,

            vote_timeout_seconds: 30.0,
            vote_required_ratio: 0.5,
            end_vote_required_ratio: 0.6,
            kick_vote_required_ratio: 0.6,
            vote_cooldown_seconds: 60.0,
            allow_end_voting: true,
            allow_sub_voting: true,
            allow_mode_voting: true,

            auto_ban_duration_seconds: 60 * 60,
            chat_spam_offenses_before_kick: 3,
            chat_spam_window_seconds: 5.0,
            chat_spam_messages_per_window: 10,
            karma: KarmaSettings::default(),

            data_dir: PathBuf::from("Data"),
        }
    }
}

/// Tuning for the reputation engine. Scores live in 0–100 with 100 as the
/// fresh-session default and 50 as the neutral reset floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KarmaSettings {
    pub enabled: bool,
    /// Scores above this drift downward.
    pub decay_threshold: f32,
    /// Downward drift per second while above the decay threshold.
    pub decay_per_second: f32,
    /// Scores below this drift upward.
    pub increase_threshold: f32,
    /// Upward drift per second while below the increase threshold.
    pub increase_per_second: f32,
    /// Below this the session is queued for automatic punishment.
    pub kick_ban_threshold: f32,
    /// Warn the session once it sinks within this band above the threshold.
    pub notification_band: f32,
    /// Punishments before the automatic kick escalates to a timed ban.
    pub kicks_before_ban: u32,

    pub damage_enemy_increase_per_point: f32,
    pub damage_friendly_decrease_per_point: f32,
    pub heal_friendly_increase_per_point: f32,
    pub structure_damage_decrease_per_point: f32,
    pub structure_repair_increase_per_point: f32,
    pub max_structure_damage_decrease_per_second: f32,
    pub item_repair_increase: f32,
    pub stun_friendly_decrease: f32,
    pub stun_rate_threshold_per_second: f32,
    pub spam_decrease: f32,
    pub wire_disconnect_decrease: f32,
    pub allowed_wire_disconnects_per_minute: usize,
    /// Seconds after being attacked during which hitting back is exempt.
    pub retaliation_grace_seconds: f64,
    pub reset_between_rounds: bool,
}

impl Default for KarmaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            decay_threshold: 50.0,
            decay_per_second: 0.1,
            increase_threshold: 25.0,
            increase_per_second: 0.05,
            kick_ban_threshold: 1.0,
            notification_band: 15.0,
            kicks_before_ban: 1,

            damage_enemy_increase_per_point: 0.015,
            damage_friendly_decrease_per_point: 0.075,
            heal_friendly_increase_per_point: 0.02,
            structure_damage_decrease_per_point: 0.01,
            structure_repair_increase_per_point: 0.01,
            max_structure_damage_decrease_per_second: 2.5,
            item_repair_increase: 0.05,
            stun_friendly_decrease: 2.0,
            stun_rate_threshold_per_second: 1.5,
            spam_decrease: 0.5,
            wire_disconnect_decrease: 2.5,
            allowed_wire_disconnects_per_minute: 5,
            retaliation_grace_seconds: 10.0,
            reset_between_rounds: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let settings = ServerSettings::default();
        assert!(settings.max_players >= 1);
        assert!(settings.mtu > shared::PACKET_FRAMING_RESERVE);
        assert!(settings.karma.decay_threshold > settings.karma.increase_threshold);
        assert!(settings.karma.kick_ban_threshold < settings.karma.increase_threshold);
        assert!(settings.kick_vote_required_ratio > 0.0);
        assert!(settings.kick_vote_required_ratio <= 1.0);
    }

    #[test]
    fn data_paths_live_under_data_dir() {
        let settings = ServerSettings::default();
        for path in [
            settings.ban_list_path(),
            settings.whitelist_path(),
            settings.permission_store_path(),
            settings.error_log_path(),
        ] {
            assert!(path.starts_with(&settings.data_dir));
        }
    }
}
