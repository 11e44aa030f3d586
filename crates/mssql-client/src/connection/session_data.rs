//! Resumable session state.
//!
//! The server reports recoverable session state (SET options, temp objects,
//! user context) as numbered state records. A connection that asked for
//! session recovery keeps the initial value of each record from the login
//! acknowledgement plus every later change; a reconnection replays both so the
//! new physical session continues where the broken one stopped.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tds_rpc::TdsVersion;

use crate::error::{Error, Result};
use crate::transport::{EnvChange, SessionStateToken};

/// Number of distinct session state ids.
pub const SESSION_STATE_COUNT: usize = 256;

/// Marker length meaning a four-byte length follows.
const LONG_LENGTH_MARKER: u8 = 0xFF;

/// Memoized alias lookups, shared by every copy of a connection's session data.
#[derive(Debug, Clone, Default)]
pub struct AliasCache {
    entries: Arc<Mutex<HashMap<String, (String, Option<String>)>>>,
}

impl AliasCache {
    /// Resolved `(server, protocol)` for a configured name.
    pub fn get(&self, name: &str) -> Option<(String, Option<String>)> {
        self.entries.lock().get(name).cloned()
    }

    /// Remember a resolution.
    pub fn insert(&self, name: String, resolved: (String, Option<String>)) {
        self.entries.lock().insert(name, resolved);
    }

    /// Number of memoized names.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been resolved yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// One changed session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStateRecord {
    /// Whether the server can restore this state.
    pub recoverable: bool,
    /// Sequence number of the change.
    pub version: u32,
    /// State payload.
    pub data: Bytes,
}

/// State of a logical connection that survives a reconnection.
#[derive(Debug, Clone)]
pub struct SessionData {
    /// Protocol version negotiated at login.
    pub tds_version: TdsVersion,
    /// Whether the transport was encrypted.
    pub encrypted: bool,
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Current collation.
    pub collation: Option<Bytes>,
    /// Database right after login.
    pub initial_database: Option<String>,
    /// Language right after login.
    pub initial_language: Option<String>,
    /// Collation right after login.
    pub initial_collation: Option<Bytes>,
    initial_state: Vec<Option<Bytes>>,
    delta: Vec<Option<SessionStateRecord>>,
    delta_dirty: bool,
    unrecoverable_count: u32,
    resolved_aliases: AliasCache,
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new(AliasCache::default())
    }
}

impl SessionData {
    /// Empty session data sharing `aliases`.
    pub fn new(aliases: AliasCache) -> Self {
        Self {
            tds_version: TdsVersion::default(),
            encrypted: false,
            database: None,
            language: None,
            collation: None,
            initial_database: None,
            initial_language: None,
            initial_collation: None,
            initial_state: vec![None; SESSION_STATE_COUNT],
            delta: vec![None; SESSION_STATE_COUNT],
            delta_dirty: false,
            unrecoverable_count: 0,
            resolved_aliases: aliases,
        }
    }

    /// The alias cache.
    pub fn resolved_aliases(&self) -> &AliasCache {
        &self.resolved_aliases
    }

    /// Initial value of state `id`.
    pub fn initial_state(&self, id: u8) -> Option<&Bytes> {
        self.initial_state[usize::from(id)].as_ref()
    }

    /// Latest change to state `id`.
    pub fn delta(&self, id: u8) -> Option<&SessionStateRecord> {
        self.delta[usize::from(id)].as_ref()
    }

    /// Number of changed states the server cannot restore.
    pub fn unrecoverable_count(&self) -> u32 {
        self.unrecoverable_count
    }

    /// Whether any state changed since the last reset.
    pub fn is_delta_dirty(&self) -> bool {
        self.delta_dirty
    }

    /// Forget the current values and every change, as after a server-side reset.
    pub fn reset(&mut self) {
        self.database = None;
        self.language = None;
        self.collation = None;
        if self.delta_dirty {
            self.delta.iter_mut().for_each(|d| *d = None);
            self.delta_dirty = false;
        }
        self.unrecoverable_count = 0;
    }

    /// Record a server session-state token.
    ///
    /// A record older than the stored one is ignored; transitions between
    /// recoverable and unrecoverable keep [`unrecoverable_count`](Self::unrecoverable_count)
    /// current.
    pub fn apply_session_state(&mut self, token: &SessionStateToken) {
        for (id, data) in &token.states {
            let slot = &mut self.delta[usize::from(*id)];
            match slot {
                Some(existing) if existing.version > token.sequence => continue,
                Some(existing) => {
                    if existing.recoverable && !token.recoverable {
                        self.unrecoverable_count += 1;
                    } else if !existing.recoverable && token.recoverable {
                        self.unrecoverable_count = self.unrecoverable_count.saturating_sub(1);
                    }
                }
                None => {
                    if !token.recoverable {
                        self.unrecoverable_count += 1;
                    }
                }
            }
            *slot = Some(SessionStateRecord {
                recoverable: token.recoverable,
                version: token.sequence,
                data: data.clone(),
            });
            self.delta_dirty = true;
        }
    }

    /// Record an environment change.
    pub fn apply_env_change(&mut self, change: &EnvChange) {
        match change {
            EnvChange::Database(db) => self.database = Some(db.clone()),
            EnvChange::Language(lang) => self.language = Some(lang.clone()),
            EnvChange::Collation(c) => self.collation = Some(c.clone()),
            EnvChange::ResetConnection => self.reset(),
        }
    }

    /// Apply a session recovery acknowledgement.
    ///
    /// After a fresh login the states are the initial values; after a
    /// recovery login they are recoverable changes at version 0.
    pub fn apply_recovery_ack(&mut self, data: &[u8], recovering: bool) -> Result<()> {
        for (id, state) in parse_recovery_ack(data)? {
            if recovering {
                self.delta[usize::from(id)] = Some(SessionStateRecord {
                    recoverable: true,
                    version: 0,
                    data: state,
                });
                self.delta_dirty = true;
            } else {
                self.initial_state[usize::from(id)] = Some(state);
            }
        }
        Ok(())
    }

    /// Capture the current database, language, and collation as the initial ones.
    pub fn capture_initial(&mut self) {
        self.initial_database = self.database.clone();
        self.initial_language = self.language.clone();
        self.initial_collation = self.collation.clone();
    }
}

/// Split a session recovery acknowledgement into `(state id, data)` records.
///
/// Each record is an id byte, a length byte (`0xFF` announces a
/// little-endian `u32` length), then the data.
pub fn parse_recovery_ack(data: &[u8]) -> Result<Vec<(u8, Bytes)>> {
    let truncated = || Error::Protocol("truncated session recovery acknowledgement".into());
    let mut records = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let id = data[i];
        let marker = *data.get(i + 1).ok_or_else(truncated)?;
        i += 2;
        let len = if marker == LONG_LENGTH_MARKER {
            let raw: [u8; 4] = data
                .get(i..i + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(truncated)?;
            i += 4;
            u32::from_le_bytes(raw) as usize
        } else {
            usize::from(marker)
        };
        let state = data.get(i..i + len).ok_or_else(truncated)?;
        records.push((id, Bytes::copy_from_slice(state)));
        i += len;
    }
    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token(sequence: u32, recoverable: bool, id: u8) -> SessionStateToken {
        SessionStateToken {
            sequence,
            recoverable,
            states: vec![(id, Bytes::from_static(b"v"))],
        }
    }

    #[test]
    fn test_unrecoverable_count_tracks_transitions() {
        let mut data = SessionData::default();
        data.apply_session_state(&token(1, false, 7));
        assert_eq!(data.unrecoverable_count(), 1);

        data.apply_session_state(&token(2, true, 7));
        assert_eq!(data.unrecoverable_count(), 0);

        data.apply_session_state(&token(3, false, 7));
        data.apply_session_state(&token(3, false, 8));
        assert_eq!(data.unrecoverable_count(), 2);
        assert!(data.is_delta_dirty());
    }

    #[test]
    fn test_stale_state_is_ignored() {
        let mut data = SessionData::default();
        data.apply_session_state(&token(5, true, 1));
        data.apply_session_state(&token(4, false, 1));
        let record = data.delta(1).unwrap();
        assert_eq!(record.version, 5);
        assert!(record.recoverable);
        assert_eq!(data.unrecoverable_count(), 0);
    }

    #[test]
    fn test_clone_deep_copies_deltas_and_shares_aliases() {
        let mut data = SessionData::default();
        data.apply_session_state(&token(1, true, 3));
        let copy = data.clone();
        data.reset();

        assert!(data.delta(3).is_none());
        assert!(copy.delta(3).is_some());

        copy.resolved_aliases()
            .insert("a".into(), ("b".into(), None));
        assert_eq!(data.resolved_aliases().len(), 1);
    }

    #[test]
    fn test_reset_clears_current_values() {
        let mut data = SessionData::default();
        data.apply_env_change(&EnvChange::Database("orders".into()));
        data.capture_initial();
        data.apply_session_state(&token(1, false, 2));
        data.apply_env_change(&EnvChange::ResetConnection);

        assert!(data.database.is_none());
        assert_eq!(data.initial_database.as_deref(), Some("orders"));
        assert_eq!(data.unrecoverable_count(), 0);
        assert!(!data.is_delta_dirty());
    }

    #[test]
    fn test_parse_recovery_ack() {
        let mut raw = vec![1, 2, b'a', b'b', 9, 0xFF];
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(b"xyz");
        let records = parse_recovery_ack(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (1, Bytes::from_static(b"ab")));
        assert_eq!(records[1], (9, Bytes::from_static(b"xyz")));

        assert!(parse_recovery_ack(&[1, 5, b'a']).is_err());
        assert!(parse_recovery_ack(&[1]).is_err());
    }

    #[test]
    fn test_recovery_ack_targets() {
        let mut fresh = SessionData::default();
        fresh.apply_recovery_ack(&[4, 1, b'x'], false).unwrap();
        assert_eq!(fresh.initial_state(4).unwrap().as_ref(), b"x");
        assert!(fresh.delta(4).is_none());

        let mut recovered = SessionData::default();
        recovered.apply_recovery_ack(&[4, 1, b'x'], true).unwrap();
        let record = recovered.delta(4).unwrap();
        assert!(record.recoverable);
        assert_eq!(record.version, 0);
    }
}
