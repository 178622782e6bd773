//! Wire protocol shared between the server core and remote clients
//!
//! Every datagram carries exactly one packet, encoded with bincode. The two
//! direction-specific enums double as the one-byte header taxonomy: the
//! variant tag is the header, and serialization/dispatch sites match on the
//! enums exhaustively.

use serde::{Deserialize, Serialize};

use crate::seq::NetId;

/// Protocol version; logins with a different version are refused.
pub const PROTOCOL_VERSION: u32 = 4;

/// Default maximum transmission unit for a single outbound packet, in bytes.
/// The transport guarantees nothing above this size fits in one datagram.
pub const DEFAULT_MTU: usize = 1200;

/// Bytes reserved in every event-carrying packet for framing (header tag,
/// sequence ids, counts) when budgeting payloads against the MTU.
pub const PACKET_FRAMING_RESERVE: usize = 16;

/// Session identifier assigned by the server; small integers, reused after
/// disconnect.
pub type SessionId = u32;

/// Platform account identifier used for reconnection matching and bans.
pub type AccountId = u64;

/// Network-visible entity identifier.
pub type EntityId = u16;

/// How the transport should treat an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// Fire and forget; may be lost, duplicated or reordered.
    Unreliable,
    /// Retransmitted until acknowledged, no ordering guarantee.
    Reliable,
    /// Retransmitted and delivered in send order.
    ReliableOrdered,
}

/// Where a chat line is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMode {
    Lobby,
    Crew,
    Radio,
    Private,
    ServerMessage,
    ServerMessageBox,
}

/// One chat line in a server-to-client update, numbered per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: NetId,
    pub sender: Option<SessionId>,
    pub sender_name: String,
    pub text: String,
    pub mode: ChatMode,
}

/// One entity event on the wire. Payload bytes are produced by the entity
/// itself; the core never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntityEvent {
    pub id: NetId,
    pub entity: EntityId,
    pub payload: Vec<u8>,
}

/// Latest transform of an entity, sent on the lossy position lane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntityTransform {
    pub entity: EntityId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub vel_x: f32,
    pub vel_y: f32,
}

/// The closed set of lobby/settings categories tracked by dirty flags. The
/// client list is deliberately not here: it runs on its own revision
/// cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyFlag {
    Name,
    Message,
    Properties,
    Misc,
    LevelSeed,
    HiddenSubs,
}

impl LobbyFlag {
    pub const ALL: [LobbyFlag; 6] = [
        LobbyFlag::Name,
        LobbyFlag::Message,
        LobbyFlag::Properties,
        LobbyFlag::Misc,
        LobbyFlag::LevelSeed,
        LobbyFlag::HiddenSubs,
    ];

    pub fn index(self) -> usize {
        match self {
            LobbyFlag::Name => 0,
            LobbyFlag::Message => 1,
            LobbyFlag::Properties => 2,
            LobbyFlag::Misc => 3,
            LobbyFlag::LevelSeed => 4,
            LobbyFlag::HiddenSubs => 5,
        }
    }
}

/// The subset of server configuration whose dirty flags are newer than the
/// recipient's acknowledged revision. `None` fields were already up to date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsDelta {
    pub name: Option<String>,
    pub message: Option<String>,
    pub properties: Option<Vec<(String, String)>>,
    pub misc: Option<MiscSettings>,
    pub level_seed: Option<String>,
    pub hidden_subs: Option<Vec<String>>,
}

impl SettingsDelta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.message.is_none()
            && self.properties.is_none()
            && self.misc.is_none()
            && self.level_seed.is_none()
            && self.hidden_subs.is_none()
    }
}

/// Grab-bag lobby settings synced under the Misc flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiscSettings {
    pub selected_sub: String,
    pub selected_mode: String,
    pub mission_type: String,
    pub traitors_enabled: bool,
}

/// One row of the client list broadcast to everyone in the lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientListEntry {
    pub session_id: SessionId,
    pub name: String,
    pub in_game: bool,
    pub ready: bool,
    pub has_permissions: bool,
}

/// A vote a session asks the coordinator to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VoteRequest {
    SwitchSub { sub: String, delivery_fee: i64 },
    PurchaseSub { sub: String },
    PurchaseAndSwitchSub { sub: String },
    TransferMoney { to: SessionId, amount: i64 },
    EndRound,
    ReadyCheck,
    Kick { target: SessionId, reason: String },
    SelectSub { sub: String },
    SelectMode { mode: String },
}

/// Tally snapshot broadcast whenever a vote changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteStatus {
    pub request: VoteRequest,
    pub starter: SessionId,
    pub yes: u32,
    pub no: u32,
    pub eligible: u32,
    pub seconds_left: f32,
}

/// Administrative commands; each one is permission-gated on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerCommand {
    Kick {
        target: SessionId,
        reason: String,
    },
    Ban {
        target: SessionId,
        reason: String,
        duration_seconds: Option<u64>,
    },
    RangeBan {
        target: SessionId,
        reason: String,
        duration_seconds: Option<u64>,
    },
    Unban {
        entry_id: u32,
    },
    SetPermissions {
        target: SessionId,
        permissions: u32,
        console_commands: Vec<String>,
    },
    ConsoleCommand {
        command: String,
    },
    SelectSub {
        sub: String,
    },
    SelectMode {
        mode: String,
    },
    ManageRound {
        end: bool,
    },
}

/// Campaign-scoped sub-messages routed by header, payloads opaque to the
/// core except for money which the coordinator needs to tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CampaignMessage {
    Crew(Vec<u8>),
    Money { to: SessionId, amount: i64 },
    Medical(Vec<u8>),
}

/// File-transfer control handshake; the byte plumbing itself lives outside
/// the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileTransferControl {
    Initiate { path: String, file_len: u64 },
    Cancel { transfer_id: u8 },
}

/// Client-reported desync diagnostics attached to an error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorReportKind {
    MissingEvent { expected_id: NetId },
    MissingEntity { entity: EntityId },
    Other { description: String },
}

/// Acknowledgement cursors a client reports while in the lobby.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LobbyAcks {
    pub lobby_revision: NetId,
    pub client_list_revision: NetId,
    pub last_recv_chat: NetId,
    pub campaign_revision: NetId,
}

/// Acknowledgement cursors a client reports while in a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InGameAcks {
    pub last_recv_entity_event: NetId,
    pub client_list_revision: NetId,
    pub last_recv_chat: NetId,
    pub campaign_revision: NetId,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientPacket {
    Login {
        protocol_version: u32,
        name: String,
        account_id: Option<AccountId>,
    },
    PingResponse {
        nonce: u32,
    },
    RequestStart,
    LobbyUpdate {
        acks: LobbyAcks,
    },
    InGameUpdate {
        acks: InGameAcks,
        first_event_id: NetId,
        events: Vec<WireEntityEvent>,
    },
    CampaignSetup {
        data: Vec<u8>,
    },
    Voice {
        data: Vec<u8>,
    },
    SettingsChange {
        name: Option<String>,
        message: Option<String>,
        properties: Vec<(String, String)>,
        level_seed: Option<String>,
        hidden_subs: Option<Vec<String>>,
    },
    Command(ServerCommand),
    Campaign(CampaignMessage),
    ReadyCheckResponse {
        ready: bool,
    },
    ReadyToSpawn,
    NameChange {
        name: String,
    },
    FileRequest {
        path: String,
    },
    ErrorReport {
        kind: ErrorReportKind,
        last_debug_messages: Vec<String>,
    },
    Chat {
        id: NetId,
        text: String,
        mode: ChatMode,
    },
    VoteStart(VoteRequest),
    VoteCast {
        yes: bool,
    },
    Disconnect {
        reason: String,
    },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerPacket {
    LoginAccepted {
        session_id: SessionId,
        name: String,
    },
    PingRequest {
        nonce: u32,
    },
    ClientPings {
        pings: Vec<(SessionId, u16)>,
    },
    UpdateLobby {
        revision: NetId,
        settings: SettingsDelta,
        client_list: Option<(NetId, Vec<ClientListEntry>)>,
        chat: Vec<ChatEntry>,
        vote_status: Option<VoteStatus>,
    },
    UpdateInGame {
        tick: u32,
        chat: Vec<ChatEntry>,
        client_list: Option<(NetId, Vec<ClientListEntry>)>,
        vote_status: Option<VoteStatus>,
    },
    EntityEvents {
        /// `Some((missed_count, first_new_id))` while the recipient is in
        /// mid-round catch-up.
        midround: Option<(u16, NetId)>,
        events: Vec<WireEntityEvent>,
    },
    Positions {
        transforms: Vec<EntityTransform>,
    },
    StartGame {
        level_seed: String,
        sub: String,
        mode: String,
        respawn_allowed: bool,
    },
    StartGameFinalize {
        unique_event_count: u16,
    },
    EndGame {
        reason: String,
    },
    Permissions {
        permissions: u32,
        console_commands: Vec<String>,
    },
    Achievement {
        identifier: String,
    },
    TraitorMessage {
        text: String,
    },
    Voice {
        from: SessionId,
        data: Vec<u8>,
    },
    CheatsEnabled {
        enabled: bool,
    },
    MissionState {
        states: Vec<u16>,
    },
    FileTransfer(FileTransferControl),
    Campaign {
        revision: NetId,
        message: CampaignMessage,
    },
    KickBanNotice {
        reason: String,
        banned: bool,
    },
    KarmaNotice {
        karma: f32,
    },
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_packet_roundtrip() {
        let packets = vec![
            ClientPacket::Login {
                protocol_version: PROTOCOL_VERSION,
                name: "Azimuth".to_string(),
                account_id: Some(7700123),
            },
            ClientPacket::Chat {
                id: 5,
                text: "diving in".to_string(),
                mode: ChatMode::Crew,
            },
            ClientPacket::InGameUpdate {
                acks: InGameAcks {
                    last_recv_entity_event: 410,
                    client_list_revision: 3,
                    last_recv_chat: 12,
                    campaign_revision: 0,
                },
                first_event_id: 9,
                events: vec![WireEntityEvent {
                    id: 9,
                    entity: 120,
                    payload: vec![1, 2, 3],
                }],
            },
            ClientPacket::VoteStart(VoteRequest::Kick {
                target: 4,
                reason: "griefing".to_string(),
            }),
            ClientPacket::Disconnect {
                reason: "quit".to_string(),
            },
        ];

        for packet in packets {
            let bytes = bincode::serialize(&packet).unwrap();
            let back: ClientPacket = bincode::deserialize(&bytes).unwrap();
            assert_eq!(
                std::mem::discriminant(&packet),
                std::mem::discriminant(&back)
            );
        }
    }

    #[test]
    fn server_packet_roundtrip() {
        let packets = vec![
            ServerPacket::LoginAccepted {
                session_id: 1,
                name: "Azimuth".to_string(),
            },
            ServerPacket::EntityEvents {
                midround: Some((40, 312)),
                events: vec![WireEntityEvent {
                    id: 311,
                    entity: 9,
                    payload: vec![0xff; 32],
                }],
            },
            ServerPacket::UpdateLobby {
                revision: 17,
                settings: SettingsDelta {
                    level_seed: Some("QXL411".to_string()),
                    ..SettingsDelta::default()
                },
                client_list: None,
                chat: vec![],
                vote_status: None,
            },
            ServerPacket::KickBanNotice {
                reason: "low karma".to_string(),
                banned: false,
            },
        ];

        for packet in packets {
            let bytes = bincode::serialize(&packet).unwrap();
            let back: ServerPacket = bincode::deserialize(&bytes).unwrap();
            assert_eq!(
                std::mem::discriminant(&packet),
                std::mem::discriminant(&back)
            );
        }
    }

    #[test]
    fn settings_delta_empty_detection() {
        let delta = SettingsDelta::default();
        assert!(delta.is_empty());

        let delta = SettingsDelta {
            name: Some("Abysswatch".to_string()),
            ..SettingsDelta::default()
        };
        assert!(!delta.is_empty());
    }

    #[test]
    fn lobby_flag_indices_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for flag in LobbyFlag::ALL {
            assert!(seen.insert(flag.index()));
        }
        assert_eq!(seen.len(), LobbyFlag::ALL.len());
    }

    #[test]
    fn event_payload_size_tracks_mtu_budget() {
        let event = WireEntityEvent {
            id: 1,
            entity: 2,
            payload: vec![0u8; 100],
        };
        let size = bincode::serialized_size(&event).unwrap() as usize;
        assert!(size > 100);
        assert!(size < DEFAULT_MTU - PACKET_FRAMING_RESERVE);
    }
}
