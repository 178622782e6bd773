//! # Authoritative Multiplayer Server Core
//!
//! This library keeps many remote clients' views of a shared, mutable world
//! consistent over an unreliable, bandwidth-constrained transport, while
//! enforcing access control and fairness policy. The world simulation
//! itself, rendering, and the transport/encryption layer are collaborators
//! behind narrow interfaces; what lives here is the protocol and
//! state-machine core:
//!
//! - **Session lifecycle** (`session`): stable small-integer session ids,
//!   per-stream wraparound sequence cursors, and a recently-disconnected
//!   set so reputation and kick votes survive a reconnect.
//! - **Entity-event synchronization** (`entity_sync`): a global ordered
//!   event log delivered reliably over an unreliable channel via
//!   wraparound acks, MTU-aware packet packing, mid-round catch-up for
//!   late joiners, and a lossy position lane beside it.
//! - **Lobby settings synchronization** (`lobby`): dirty-flag propagation
//!   of server-wide configuration, each session tracked by the last
//!   revision it acknowledged.
//! - **Voting** (`votes`): a single-active-vote-plus-queue state machine,
//!   with kick votes tallied separately per target.
//! - **Moderation** (`karma`, `banlist`, `permissions`): a decaying
//!   reputation score driving automatic punishment, persistent ban and
//!   allow lists with range matching, and stored permission grants.
//! - **The tick loop** (`server`): one fixed-rate synchronous tick that
//!   drains inbound messages, runs every subsystem, and emits outbound
//!   packets. Multi-tick waits are explicit deadlines, never blocking.
//!
//! ## Concurrency model
//!
//! All mutation of session, event-log, vote, and moderation state happens
//! inside one tick's synchronous processing. The async shell around the
//! core only shuttles datagrams between the socket and the tick loop. The
//! one external concurrency concern the core tolerates is out-of-order or
//! duplicate arrival of client acknowledgements, absorbed by the
//! wraparound-aware cursor comparisons; a stale report never moves a
//! cursor backward.

pub mod banlist;
pub mod entity_sync;
pub mod error;
pub mod karma;
pub mod lobby;
pub mod permissions;
pub mod server;
pub mod session;
pub mod settings;
pub mod votes;
pub mod world;
