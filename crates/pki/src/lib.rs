// Path: crates/pki/src/lib.rs
//! # Herd PKI Store
//!
//! The durable registry of minion identities and their public keys. One
//! `.pub` file per minion, filed by state:
//!
//! ```text
//! <pki_dir>/minions/<id>.pub            accepted
//! <pki_dir>/minions_pending/<id>.pub    pending
//! <pki_dir>/minions_rejected/<id>.pub   rejected
//! <pki_dir>/minions_denied/<id>.pub     denied submissions (evidence)
//! ```
//!
//! Transitions are crash-safe: the key is written to a temp file, fsynced,
//! and renamed into the target directory before the old state file is
//! removed. Lookup resolves the surviving duplicate by state priority, so
//! a crash between the two steps never loses a key. All mutations
//! serialise through a single writer lock.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

use chrono::{DateTime, Utc};
use herd_types::error::{CoreError, InternalError, UserError};
use herd_types::MinionId;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The lifecycle state of a minion key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// Accepted by the operator; the only state that may receive
    /// publications or have returns accepted.
    Accepted,
    /// Enrolled, awaiting an operator decision.
    Pending,
    /// Refused by the operator.
    Rejected,
    /// A submission that did not match the stored key for its id.
    Denied,
}

impl KeyState {
    /// The directory a state files under.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Accepted => "minions",
            Self::Pending => "minions_pending",
            Self::Rejected => "minions_rejected",
            Self::Denied => "minions_denied",
        }
    }

    /// All states, in lookup-priority order. A crash mid-transition can
    /// leave a key filed twice; the earlier state here wins and the
    /// leftover is swept on the next transition.
    pub fn all() -> [KeyState; 4] {
        [Self::Accepted, Self::Pending, Self::Rejected, Self::Denied]
    }
}

impl std::fmt::Display for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// One minion's registry entry.
#[derive(Clone, Debug)]
pub struct KeyRecord {
    /// The minion identity.
    pub id: MinionId,
    /// Current state.
    pub state: KeyState,
    /// The stored public key, PEM.
    pub pub_pem: String,
    /// When the key entered this state (file mtime).
    pub since: Option<DateTime<Utc>>,
}

/// The durable key registry.
pub struct KeyStore {
    root: PathBuf,
    writer: Mutex<()>,
}

fn io_err(ctx: &str, e: impl std::fmt::Display) -> CoreError {
    InternalError::Io(format!("{}: {}", ctx, e)).into()
}

fn unknown_key(id: &MinionId) -> CoreError {
    UserError::InvalidTarget(format!("no such key: {}", id)).into()
}

impl KeyStore {
    /// Opens (and if needed creates) the registry under `pki_dir`.
    pub fn open(pki_dir: &Path) -> Result<Self, CoreError> {
        for state in KeyState::all() {
            std::fs::create_dir_all(pki_dir.join(state.dir_name()))
                .map_err(|e| io_err("create pki dirs", e))?;
        }
        Ok(Self {
            root: pki_dir.to_path_buf(),
            writer: Mutex::new(()),
        })
    }

    fn key_path(&self, state: KeyState, id: &MinionId) -> PathBuf {
        self.root
            .join(state.dir_name())
            .join(format!("{}.pub", id))
    }

    /// Looks up a minion's current record.
    pub fn lookup(&self, id: &MinionId) -> Result<Option<KeyRecord>, CoreError> {
        if !id.is_path_safe() {
            return Ok(None);
        }
        for state in KeyState::all() {
            let path = self.key_path(state, id);
            match std::fs::read_to_string(&path) {
                Ok(pub_pem) => {
                    let since = std::fs::metadata(&path)
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(DateTime::<Utc>::from);
                    return Ok(Some(KeyRecord {
                        id: id.clone(),
                        state,
                        pub_pem,
                        since,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("read key", e)),
            }
        }
        Ok(None)
    }

    /// Enrols a first-contact key as pending. Fails if the id exists in
    /// any state.
    pub fn enroll_pending(&self, id: &MinionId, pub_pem: &str) -> Result<(), CoreError> {
        if !id.is_path_safe() {
            return Err(UserError::InvalidTarget(format!("unusable minion id: {:?}", id.as_str())).into());
        }
        let _guard = self.writer.lock();
        if self.lookup(id)?.is_some() {
            return Err(UserError::InvalidTarget(format!("key already enrolled: {}", id)).into());
        }
        self.write_key(KeyState::Pending, id, pub_pem)?;
        tracing::info!(id = %id, "minion key enrolled as pending");
        Ok(())
    }

    /// Records a denied submission without touching the canonical state.
    pub fn record_denied(&self, id: &MinionId, pub_pem: &str) -> Result<(), CoreError> {
        if !id.is_path_safe() {
            return Ok(());
        }
        let _guard = self.writer.lock();
        self.write_key(KeyState::Denied, id, pub_pem)
    }

    /// Operator accept: pending or rejected becomes accepted.
    pub fn accept(&self, id: &MinionId) -> Result<(), CoreError> {
        self.transition(id, &[KeyState::Pending, KeyState::Rejected], KeyState::Accepted)
    }

    /// Operator reject: pending or accepted becomes rejected.
    pub fn reject(&self, id: &MinionId) -> Result<(), CoreError> {
        self.transition(id, &[KeyState::Pending, KeyState::Accepted], KeyState::Rejected)
    }

    /// Removes the id from every state, including denied evidence.
    pub fn delete(&self, id: &MinionId) -> Result<(), CoreError> {
        let _guard = self.writer.lock();
        let mut found = false;
        for state in KeyState::all() {
            let path = self.key_path(state, id);
            match std::fs::remove_file(&path) {
                Ok(()) => found = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err("delete key", e)),
            }
        }
        if !found {
            return Err(unknown_key(id));
        }
        tracing::info!(id = %id, "minion key deleted");
        Ok(())
    }

    /// Ids currently in `state`, sorted.
    pub fn list_by_state(&self, state: KeyState) -> Result<Vec<MinionId>, CoreError> {
        let dir = self.root.join(state.dir_name());
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| io_err("list keys", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err("list keys", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".pub") {
                let id = MinionId::new(id);
                // A crash leftover in a lower-priority dir is not this
                // id's canonical state; hide it from listings.
                if let Some(record) = self.lookup(&id)? {
                    if record.state == state {
                        out.push(id);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Every record in every state, accepted first.
    pub fn list_all(&self) -> Result<Vec<KeyRecord>, CoreError> {
        let mut out = Vec::new();
        for state in KeyState::all() {
            for id in self.list_by_state(state)? {
                if let Some(record) = self.lookup(&id)? {
                    if record.state == state {
                        out.push(record);
                    }
                }
            }
        }
        Ok(out)
    }

    fn transition(
        &self,
        id: &MinionId,
        from: &[KeyState],
        to: KeyState,
    ) -> Result<(), CoreError> {
        let _guard = self.writer.lock();
        let record = self.lookup(id)?.ok_or_else(|| unknown_key(id))?;
        if record.state == to {
            return Ok(());
        }
        if !from.contains(&record.state) {
            return Err(UserError::InvalidTarget(format!(
                "key {} is {}, cannot move to {}",
                id, record.state, to
            ))
            .into());
        }
        // New state file lands first; only then is the old one removed.
        self.write_key(to, id, &record.pub_pem)?;
        std::fs::remove_file(self.key_path(record.state, id))
            .map_err(|e| io_err("remove old state", e))?;
        tracing::info!(id = %id, from = %record.state, to = %to, "minion key transitioned");
        Ok(())
    }

    fn write_key(&self, state: KeyState, id: &MinionId, pub_pem: &str) -> Result<(), CoreError> {
        let dir = self.root.join(state.dir_name());
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io_err("temp key", e))?;
        tmp.write_all(pub_pem.as_bytes())
            .map_err(|e| io_err("write key", e))?;
        tmp.as_file().sync_all().map_err(|e| io_err("fsync key", e))?;
        tmp.persist(self.key_path(state, id))
            .map_err(|e| io_err("rename key", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM_A: &str = "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n";
    const PEM_B: &str = "-----BEGIN PUBLIC KEY-----\nBBBB\n-----END PUBLIC KEY-----\n";

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn m(id: &str) -> MinionId {
        MinionId::new(id)
    }

    #[test]
    fn test_enroll_accept_flow() {
        let (_dir, store) = store();
        store.enroll_pending(&m("m1"), PEM_A).unwrap();
        let rec = store.lookup(&m("m1")).unwrap().unwrap();
        assert_eq!(rec.state, KeyState::Pending);
        assert_eq!(rec.pub_pem, PEM_A);

        store.accept(&m("m1")).unwrap();
        let rec = store.lookup(&m("m1")).unwrap().unwrap();
        assert_eq!(rec.state, KeyState::Accepted);
        // Accepting again is idempotent.
        store.accept(&m("m1")).unwrap();
    }

    #[test]
    fn test_duplicate_enrolment_refused() {
        let (_dir, store) = store();
        store.enroll_pending(&m("m1"), PEM_A).unwrap();
        assert!(store.enroll_pending(&m("m1"), PEM_B).is_err());
        store.accept(&m("m1")).unwrap();
        assert!(store.enroll_pending(&m("m1"), PEM_B).is_err());
    }

    #[test]
    fn test_exactly_one_state_per_id() {
        let (dir, store) = store();
        store.enroll_pending(&m("m1"), PEM_A).unwrap();
        store.accept(&m("m1")).unwrap();
        store.reject(&m("m1")).unwrap();

        let mut present = 0;
        for state in KeyState::all() {
            if dir
                .path()
                .join(state.dir_name())
                .join("m1.pub")
                .exists()
            {
                present += 1;
            }
        }
        assert_eq!(present, 1);
    }

    #[test]
    fn test_crash_leftover_resolved_by_priority() {
        let (dir, store) = store();
        // Simulate a crash between write-new and remove-old: the key is
        // filed both accepted and pending.
        std::fs::write(dir.path().join("minions/m1.pub"), PEM_A).unwrap();
        std::fs::write(dir.path().join("minions_pending/m1.pub"), PEM_A).unwrap();

        let rec = store.lookup(&m("m1")).unwrap().unwrap();
        assert_eq!(rec.state, KeyState::Accepted);
        // The listing hides the stale pending copy.
        assert!(store.list_by_state(KeyState::Pending).unwrap().is_empty());
    }

    #[test]
    fn test_denied_evidence_does_not_transition() {
        let (_dir, store) = store();
        store.enroll_pending(&m("m1"), PEM_A).unwrap();
        store.accept(&m("m1")).unwrap();
        store.record_denied(&m("m1"), PEM_B).unwrap();

        // Canonical state is untouched.
        let rec = store.lookup(&m("m1")).unwrap().unwrap();
        assert_eq!(rec.state, KeyState::Accepted);
        assert_eq!(rec.pub_pem, PEM_A);
    }

    #[test]
    fn test_delete_clears_everything() {
        let (_dir, store) = store();
        store.enroll_pending(&m("m1"), PEM_A).unwrap();
        store.record_denied(&m("m1"), PEM_B).unwrap();
        store.delete(&m("m1")).unwrap();
        assert!(store.lookup(&m("m1")).unwrap().is_none());
        assert!(store.delete(&m("m1")).is_err());
    }

    #[test]
    fn test_path_unsafe_id_refused() {
        let (_dir, store) = store();
        assert!(store.enroll_pending(&m("../evil"), PEM_A).is_err());
        assert!(store.lookup(&m("../evil")).unwrap().is_none());
    }

    #[test]
    fn test_list_by_state() {
        let (_dir, store) = store();
        for id in ["m1", "m2", "m3"] {
            store.enroll_pending(&m(id), PEM_A).unwrap();
        }
        store.accept(&m("m2")).unwrap();
        assert_eq!(
            store.list_by_state(KeyState::Pending).unwrap(),
            vec![m("m1"), m("m3")]
        );
        assert_eq!(
            store.list_by_state(KeyState::Accepted).unwrap(),
            vec![m("m2")]
        );
    }
}
