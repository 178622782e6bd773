//! Lobby/settings synchronization
//!
//! Server-wide configuration is grouped under a small closed set of dirty
//! flags. A wraparound revision counter bumps whenever any flag's value
//! changes; each session remembers the last revision it acknowledged, and a
//! write serializes only the flags that changed since then. A fresh session
//! acks revision 0, which makes every flag due.

use log::debug;
use shared::{
    id_more_recent, id_more_recent_or_equal, LobbyFlag, MiscSettings, NetId, SettingsDelta,
};

use crate::settings::ServerSettings;

/// Tracks per-flag change revisions against the global lobby revision.
#[derive(Debug)]
pub struct LobbySynchronizer {
    revision: NetId,
    changed_at: [NetId; LobbyFlag::ALL.len()],
}

impl LobbySynchronizer {
    /// Starts at revision 1 with every flag marked changed, so that the
    /// initial state reaches every session.
    pub fn new() -> Self {
        Self {
            revision: 1,
            changed_at: [1; LobbyFlag::ALL.len()],
        }
    }

    pub fn revision(&self) -> NetId {
        self.revision
    }

    /// Bumps the revision and stamps the flag. Revision 0 is reserved for
    /// "nothing seen yet", so the counter skips it when wrapping.
    pub fn touch(&mut self, flag: LobbyFlag) {
        self.revision = self.revision.wrapping_add(1);
        if self.revision == 0 {
            self.revision = 1;
        }
        self.changed_at[flag.index()] = self.revision;
        debug!("Lobby flag {:?} dirty at revision {}", flag, self.revision);
    }

    fn is_due(&self, flag: LobbyFlag, acked: NetId) -> bool {
        acked == 0 || id_more_recent(self.changed_at[flag.index()], acked)
    }

    /// Flags newer than the session's acknowledged revision.
    pub fn due_flags(&self, acked: NetId) -> Vec<LobbyFlag> {
        LobbyFlag::ALL
            .iter()
            .copied()
            .filter(|flag| self.is_due(*flag, acked))
            .collect()
    }

    /// Serializes exactly the due flags out of the current settings.
    pub fn build_delta(&self, acked: NetId, settings: &ServerSettings) -> SettingsDelta {
        let mut delta = SettingsDelta::default();
        for flag in self.due_flags(acked) {
            match flag {
                LobbyFlag::Name => delta.name = Some(settings.name.clone()),
                LobbyFlag::Message => {
                    delta.message = Some(settings.message_of_the_day.clone());
                }
                LobbyFlag::Properties => {
                    delta.properties = Some(
                        settings
                            .properties
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    );
                }
                LobbyFlag::Misc => {
                    delta.misc = Some(MiscSettings {
                        selected_sub: settings.selected_sub.clone(),
                        selected_mode: settings.selected_mode.clone(),
                        mission_type: settings.mission_type.clone(),
                        traitors_enabled: settings.traitors_enabled,
                    });
                }
                LobbyFlag::LevelSeed => delta.level_seed = Some(settings.level_seed.clone()),
                LobbyFlag::HiddenSubs => delta.hidden_subs = Some(settings.hidden_subs.clone()),
            }
        }
        delta
    }

    /// Moves a session's lobby cursor forward. Stale reports and reports
    /// ahead of the current revision are ignored.
    pub fn ack(&self, cursor: &mut NetId, reported: NetId) {
        if reported == 0 {
            return;
        }
        if id_more_recent_or_equal(reported, *cursor)
            && !id_more_recent(reported, self.revision)
        {
            *cursor = reported;
        }
    }
}

impl Default for LobbySynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Revision counter for the client-list stream, which runs on its own
/// cursor separate from the settings flags.
#[derive(Debug)]
pub struct ClientListSync {
    revision: NetId,
}

impl ClientListSync {
    pub fn new() -> Self {
        Self { revision: 1 }
    }

    pub fn revision(&self) -> NetId {
        self.revision
    }

    /// Called whenever membership, a name, readiness, or permissions change.
    pub fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        if self.revision == 0 {
            self.revision = 1;
        }
    }

    /// Whether the session with the given cursor still needs the list.
    pub fn is_due(&self, acked: NetId) -> bool {
        acked == 0 || id_more_recent(self.revision, acked)
    }

    pub fn ack(&self, cursor: &mut NetId, reported: NetId) {
        if reported == 0 {
            return;
        }
        if id_more_recent_or_equal(reported, *cursor)
            && !id_more_recent(reported, self.revision)
        {
            *cursor = reported;
        }
    }
}

impl Default for ClientListSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_gets_every_flag() {
        let lobby = LobbySynchronizer::new();
        let delta = lobby.build_delta(0, &ServerSettings::default());
        assert!(delta.name.is_some());
        assert!(delta.message.is_some());
        assert!(delta.properties.is_some());
        assert!(delta.misc.is_some());
        assert!(delta.level_seed.is_some());
        assert!(delta.hidden_subs.is_some());
    }

    #[test]
    fn up_to_date_session_gets_nothing() {
        let lobby = LobbySynchronizer::new();
        let delta = lobby.build_delta(lobby.revision(), &ServerSettings::default());
        assert!(delta.is_empty());
    }

    #[test]
    fn only_changed_flags_are_resent() {
        let mut lobby = LobbySynchronizer::new();
        let mut settings = ServerSettings::default();

        let seen = lobby.revision();
        settings.level_seed = "QXL411".to_string();
        lobby.touch(LobbyFlag::LevelSeed);

        let delta = lobby.build_delta(seen, &settings);
        assert_eq!(delta.level_seed.as_deref(), Some("QXL411"));
        assert!(delta.name.is_none());
        assert!(delta.misc.is_none());
    }

    #[test]
    fn ack_moves_cursor_forward_only() {
        let mut lobby = LobbySynchronizer::new();
        lobby.touch(LobbyFlag::Name);
        lobby.touch(LobbyFlag::Message);
        let revision = lobby.revision();

        let mut cursor: NetId = 0;
        lobby.ack(&mut cursor, revision);
        assert_eq!(cursor, revision);

        // stale report is ignored
        lobby.ack(&mut cursor, 1);
        assert_eq!(cursor, revision);

        // a report from the future is ignored
        lobby.ack(&mut cursor, revision.wrapping_add(5));
        assert_eq!(cursor, revision);
    }

    #[test]
    fn revision_skips_zero_on_wrap() {
        let mut lobby = LobbySynchronizer::new();
        // walk the counter to just before the wrap point
        for _ in 0..u16::MAX {
            lobby.touch(LobbyFlag::Misc);
        }
        assert_ne!(lobby.revision(), 0);

        lobby.touch(LobbyFlag::Misc);
        assert_ne!(lobby.revision(), 0);
    }

    #[test]
    fn client_list_due_until_acked() {
        let mut list = ClientListSync::new();
        let mut cursor: NetId = 0;
        assert!(list.is_due(cursor));

        list.ack(&mut cursor, list.revision());
        assert!(!list.is_due(cursor));

        list.bump();
        assert!(list.is_due(cursor));
    }
}
