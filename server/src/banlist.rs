//! Persistent ban list and whitelist
//!
//! Bans match on account id first, then on address, where an address ban is
//! either exact or a "range" covering a whole /24-style prefix (last octet
//! replaced by the `x` wildcard). Loopback is always exempt. Expired
//! entries are purged lazily on lookup and on save, never on a timer.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use shared::AccountId;

use crate::error::PersistError;

/// Wildcard marker used in the last octet of a range address.
const RANGE_WILDCARD: &str = "x";

/// An IPv4 prefix ban: matches any address sharing the first three octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAddress {
    prefix: [u8; 3],
}

impl RangeAddress {
    /// Parses `"203.0.113.x"`. Returns `None` unless the string is three
    /// octets followed by the wildcard marker.
    pub fn parse(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() != 4 || parts[3] != RANGE_WILDCARD {
            return None;
        }
        let mut prefix = [0u8; 3];
        for (slot, part) in prefix.iter_mut().zip(&parts[..3]) {
            *slot = part.parse().ok()?;
        }
        Some(Self { prefix })
    }

    /// The range covering the given address, if it is IPv4.
    pub fn covering(addr: IpAddr) -> Option<Self> {
        match addr {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                Some(Self {
                    prefix: [octets[0], octets[1], octets[2]],
                })
            }
            IpAddr::V6(_) => None,
        }
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => v4.octets()[..3] == self.prefix,
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for RangeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.prefix[0], self.prefix[1], self.prefix[2], RANGE_WILDCARD
        )
    }
}

/// What a ban entry matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanMatcher {
    Address(IpAddr),
    Range(RangeAddress),
    Account(AccountId),
}

impl BanMatcher {
    /// Parses the `identifier` column of a persisted entry: a numeric
    /// account id, a range address, or an exact address.
    fn parse(text: &str) -> Option<Self> {
        if let Some(range) = RangeAddress::parse(text) {
            return Some(BanMatcher::Range(range));
        }
        if let Ok(addr) = text.parse::<IpAddr>() {
            return Some(BanMatcher::Address(addr));
        }
        text.parse::<AccountId>().ok().map(BanMatcher::Account)
    }
}

impl fmt::Display for BanMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanMatcher::Address(addr) => write!(f, "{}", addr),
            BanMatcher::Range(range) => write!(f, "{}", range),
            BanMatcher::Account(id) => write!(f, "{}", id),
        }
    }
}

/// One ban list entry. The id is a small monotonically increasing integer
/// handed to admin UIs for removal.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub id: u32,
    pub name: String,
    pub matcher: BanMatcher,
    /// Unix timestamp after which the ban no longer applies.
    pub expiry_unix: Option<u64>,
    pub reason: String,
}

impl BanEntry {
    fn is_expired(&self, now_unix: u64) -> bool {
        matches!(self.expiry_unix, Some(expiry) if expiry <= now_unix)
    }
}

/// The persistent deny list.
#[derive(Debug)]
pub struct BanRegistry {
    entries: Vec<BanEntry>,
    next_id: u32,
    path: PathBuf,
}

impl BanRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            path,
        }
    }

    /// Loads the line-oriented ban file: `name,identifier,expiryOrEmpty,
    /// reasonOptional`. Lines with a stale expiry are skipped, malformed
    /// lines are warned about and skipped; neither aborts the load.
    pub fn load(path: &Path, now_unix: u64) -> Result<Self, PersistError> {
        let mut registry = Self::new(path.to_path_buf());
        if !path.exists() {
            return Ok(registry);
        }
        let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut columns = line.splitn(4, ',');
            let name = columns.next().unwrap_or_default().to_string();
            let identifier = columns.next().unwrap_or_default();
            let expiry_text = columns.next().unwrap_or_default().trim();
            let reason = columns.next().unwrap_or_default().to_string();

            let Some(matcher) = BanMatcher::parse(identifier) else {
                warn!(
                    "{}:{}: unrecognized ban identifier \"{}\", skipping",
                    path.display(),
                    line_no + 1,
                    identifier
                );
                continue;
            };
            let expiry_unix = if expiry_text.is_empty() {
                None
            } else {
                match expiry_text.parse::<u64>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(
                            "{}:{}: unparseable expiry \"{}\", skipping",
                            path.display(),
                            line_no + 1,
                            expiry_text
                        );
                        continue;
                    }
                }
            };

            let entry = BanEntry {
                id: registry.next_id,
                name,
                matcher,
                expiry_unix,
                reason,
            };
            if entry.is_expired(now_unix) {
                debug!("Skipping expired ban entry for {}", entry.matcher);
                continue;
            }
            registry.next_id += 1;
            registry.entries.push(entry);
        }
        info!("Loaded {} ban entr(ies)", registry.entries.len());
        Ok(registry)
    }

    /// Writes the list back out, dropping expired entries in the process.
    pub fn save(&mut self, now_unix: u64) -> Result<(), PersistError> {
        self.purge_expired(now_unix);
        let mut text = String::new();
        for entry in &self.entries {
            let expiry = entry
                .expiry_unix
                .map(|v| v.to_string())
                .unwrap_or_default();
            text.push_str(&format!(
                "{},{},{},{}\n",
                entry.name, entry.matcher, expiry, entry.reason
            ));
        }
        fs::write(&self.path, text).map_err(|source| PersistError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn save_or_warn(&mut self, now_unix: u64) {
        if let Err(err) = self.save(now_unix) {
            warn!("Failed to save ban list: {}", err);
        }
    }

    fn purge_expired(&mut self, now_unix: u64) {
        self.entries.retain(|entry| !entry.is_expired(now_unix));
    }

    /// Returns the ban reason if the identity is banned. Account id is
    /// checked first, then address; loopback addresses are always exempt.
    pub fn is_banned(
        &mut self,
        addr: IpAddr,
        account_id: Option<AccountId>,
        now_unix: u64,
    ) -> Option<String> {
        if addr.is_loopback() {
            return None;
        }
        self.purge_expired(now_unix);

        if let Some(account) = account_id {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.matcher == BanMatcher::Account(account))
            {
                return Some(entry.reason.clone());
            }
        }

        self.entries
            .iter()
            .find(|e| match &e.matcher {
                BanMatcher::Address(banned) => *banned == addr,
                BanMatcher::Range(range) => range.matches(addr),
                BanMatcher::Account(_) => false,
            })
            .map(|e| e.reason.clone())
    }

    /// Adds a ban. An identical matcher replaces the existing entry; a
    /// range ban also removes every narrower address ban it subsumes.
    pub fn ban(
        &mut self,
        name: &str,
        matcher: BanMatcher,
        expiry_unix: Option<u64>,
        reason: &str,
    ) -> u32 {
        if let BanMatcher::Range(range) = &matcher {
            let range = *range;
            self.entries.retain(|entry| match &entry.matcher {
                BanMatcher::Address(addr) => !range.matches(*addr),
                BanMatcher::Range(existing) => *existing != range,
                BanMatcher::Account(_) => true,
            });
        } else {
            self.entries.retain(|entry| entry.matcher != matcher);
        }

        let id = self.next_id;
        self.next_id += 1;
        info!(
            "audit: banned {} ({}) until {:?}: {}",
            name, matcher, expiry_unix, reason
        );
        self.entries.push(BanEntry {
            id,
            name: name.to_string(),
            matcher,
            expiry_unix,
            reason: reason.to_string(),
        });
        id
    }

    /// Removes an entry by its UI id. Returns whether anything was removed.
    pub fn unban(&mut self, entry_id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != entry_id);
        let removed = self.entries.len() != before;
        if removed {
            info!("audit: removed ban entry {}", entry_id);
        } else {
            warn!("Unban for unknown entry id {}", entry_id);
        }
        removed
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.entries
    }
}

/// One whitelist row: a name, optionally pinned to an address.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pub name: String,
    pub addr: Option<IpAddr>,
}

/// Strict allow-list by name. When enabled, unlisted names are rejected at
/// login; a pinned address must also match.
#[derive(Debug)]
pub struct Whitelist {
    pub enabled: bool,
    entries: Vec<WhitelistEntry>,
    path: PathBuf,
}

impl Whitelist {
    pub fn new(path: PathBuf) -> Self {
        Self {
            enabled: false,
            entries: Vec::new(),
            path,
        }
    }

    /// Loads the whitelist file: first line `#true`/`#false` toggles
    /// enforcement, each following line is `name,address` (address may be
    /// empty).
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let mut whitelist = Self::new(path.to_path_buf());
        if !path.exists() {
            return Ok(whitelist);
        }
        let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut lines = text.lines();
        whitelist.enabled = matches!(lines.next(), Some("#true"));
        for (line_no, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, addr_text) = line.split_once(',').unwrap_or((line, ""));
            let addr = if addr_text.is_empty() {
                None
            } else {
                match addr_text.parse::<IpAddr>() {
                    Ok(addr) => Some(addr),
                    Err(_) => {
                        warn!(
                            "{}:{}: bad whitelist address \"{}\", entry kept without pin",
                            path.display(),
                            line_no + 2,
                            addr_text
                        );
                        None
                    }
                }
            };
            whitelist.entries.push(WhitelistEntry {
                name: name.to_string(),
                addr,
            });
        }
        Ok(whitelist)
    }

    pub fn save(&self) -> Result<(), PersistError> {
        let mut text = String::new();
        text.push_str(if self.enabled { "#true\n" } else { "#false\n" });
        for entry in &self.entries {
            let addr = entry.addr.map(|a| a.to_string()).unwrap_or_default();
            text.push_str(&format!("{},{}\n", entry.name, addr));
        }
        fs::write(&self.path, text).map_err(|source| PersistError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn save_or_warn(&self) {
        if let Err(err) = self.save() {
            warn!("Failed to save whitelist: {}", err);
        }
    }

    pub fn is_allowed(&self, name: &str, addr: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        self.entries.iter().any(|entry| {
            entry.name == name && entry.addr.map_or(true, |pinned| pinned == addr)
        })
    }

    pub fn add(&mut self, name: &str, addr: Option<IpAddr>) {
        if !self.entries.iter().any(|e| e.name == name && e.addr == addr) {
            self.entries.push(WhitelistEntry {
                name: name.to_string(),
                addr,
            });
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }
}
