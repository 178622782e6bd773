//! Types shared between the authoritative server and its remote clients:
//! the wire protocol, the wraparound sequence-id arithmetic, and the
//! constants both sides must agree on.

pub mod protocol;
pub mod seq;

pub use protocol::{
    AccountId, ChatEntry, ChatMode, ClientListEntry, ClientPacket, DeliveryClass, EntityId,
    EntityTransform, ErrorReportKind, FileTransferControl, InGameAcks, LobbyAcks, LobbyFlag,
    MiscSettings, ServerCommand, ServerPacket, SessionId, SettingsDelta, VoteRequest, VoteStatus,
    WireEntityEvent, DEFAULT_MTU, PACKET_FRAMING_RESERVE, PROTOCOL_VERSION,
};
pub use seq::{id_after, id_before, id_diff, id_more_recent, id_more_recent_or_equal, NetId};
