//! Client permission bits and the persisted permission store

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::AccountId;

use crate::error::PersistError;

/// Permission bitset carried by every session. Stored as a plain `u32` on
/// the wire; the constants below are the defined bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const KICK: Permissions = Permissions(1 << 0);
    pub const BAN: Permissions = Permissions(1 << 1);
    pub const UNBAN: Permissions = Permissions(1 << 2);
    pub const SELECT_SUB: Permissions = Permissions(1 << 3);
    pub const SELECT_MODE: Permissions = Permissions(1 << 4);
    pub const MANAGE_SETTINGS: Permissions = Permissions(1 << 5);
    pub const MANAGE_ROUND: Permissions = Permissions(1 << 6);
    pub const CONSOLE_COMMANDS: Permissions = Permissions(1 << 7);
    pub const SERVER_LOG: Permissions = Permissions(1 << 8);
    pub const MANAGE_CAMPAIGN: Permissions = Permissions(1 << 9);
    pub const ALL: Permissions = Permissions(u32::MAX);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Permissions) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Permissions) {
        self.0 &= !other.0;
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Identity key a stored permission record matches against. Account id wins
/// over address when both sides have one, mirroring reconnection matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionKey {
    Address(IpAddr),
    Account(AccountId),
}

/// One persisted permission grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPermission {
    pub name: String,
    pub key: PermissionKey,
    pub permissions: Permissions,
    pub console_commands: HashSet<String>,
}

/// Permission grants persisted as JSON records, looked up at login.
#[derive(Debug)]
pub struct PermissionStore {
    records: Vec<SavedPermission>,
    path: PathBuf,
}

impl PermissionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            records: Vec::new(),
            path,
        }
    }

    /// Loads records from disk. A missing file is an empty store, not an
    /// error; a malformed file aborts the load and leaves the store empty.
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let mut store = Self::new(path.to_path_buf());
        if !path.exists() {
            return Ok(store);
        }
        let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        store.records =
            serde_json::from_str(&text).map_err(|err| PersistError::Malformed {
                path: path.display().to_string(),
                line: err.line(),
                reason: err.to_string(),
            })?;
        info!("Loaded {} permission record(s)", store.records.len());
        Ok(store)
    }

    pub fn save(&self) -> Result<(), PersistError> {
        let text = serde_json::to_string_pretty(&self.records).map_err(|err| {
            PersistError::Malformed {
                path: self.path.display().to_string(),
                line: 0,
                reason: err.to_string(),
            }
        })?;
        fs::write(&self.path, text).map_err(|source| PersistError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Finds the stored grant for an identity. Account-id records are
    /// preferred over address records when both match.
    pub fn lookup(&self, addr: IpAddr, account_id: Option<AccountId>) -> Option<&SavedPermission> {
        if let Some(account) = account_id {
            if let Some(record) = self
                .records
                .iter()
                .find(|r| r.key == PermissionKey::Account(account))
            {
                return Some(record);
            }
        }
        self.records
            .iter()
            .find(|r| r.key == PermissionKey::Address(addr))
    }

    /// Inserts or replaces the grant for a key. Granting `NONE` deletes the
    /// record instead of storing an empty one.
    pub fn set(
        &mut self,
        name: String,
        key: PermissionKey,
        permissions: Permissions,
        console_commands: HashSet<String>,
    ) {
        self.records.retain(|r| r.key != key);
        if permissions.is_none() && console_commands.is_empty() {
            return;
        }
        self.records.push(SavedPermission {
            name,
            key,
            permissions,
            console_commands,
        });
    }

    /// Saves and downgrades failures to a warning; in-memory state stays
    /// authoritative either way.
    pub fn save_or_warn(&self) {
        if let Err(err) = self.save() {
            warn!("Failed to save permission store: {}", err);
        }
    }
}
