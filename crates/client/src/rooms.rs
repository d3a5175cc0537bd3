//! Durable record of which rooms a session belongs to.
//!
//! Memberships are cached in memory and persisted to a JSON file keyed by
//! session, so restoration after a restart knows what to re-join.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tether_protocol::RoomId;

/// Errors from the room store.
#[derive(Debug, thiserror::Error)]
pub enum RoomStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One room membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMembershipRecord {
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
}

type Sessions = HashMap<String, Vec<RoomMembershipRecord>>;

/// Persistent room tracker for one session.
pub struct RoomTracker {
    path: PathBuf,
    session_key: String,
    sessions: RwLock<Sessions>,
}

impl RoomTracker {
    /// Opens the store at `path`, loading any existing memberships.
    pub fn open(path: PathBuf, session_key: impl Into<String>) -> Result<Self, RoomStoreError> {
        let sessions = load_sessions(&path)?;
        Ok(Self {
            path,
            session_key: session_key.into(),
            sessions: RwLock::new(sessions),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Sessions> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sessions> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Records a membership. Returns `false` if the room was already there.
    pub fn add_room(&self, room_id: &str) -> Result<bool, RoomStoreError> {
        let mut map = self.write();
        let records = map.get(&self.session_key).map(Vec::as_slice).unwrap_or_default();
        if records.iter().any(|r| r.room_id == room_id) {
            return Ok(false);
        }
        let mut next = map.clone();
        next.entry(self.session_key.clone())
            .or_default()
            .push(RoomMembershipRecord {
                room_id: room_id.to_string(),
                joined_at: Utc::now(),
            });
        self.commit(&mut map, next)?;
        Ok(true)
    }

    /// Forgets a membership. Returns `false` if it was not recorded.
    pub fn remove_room(&self, room_id: &str) -> Result<bool, RoomStoreError> {
        let mut map = self.write();
        let Some(records) = map.get(&self.session_key) else {
            return Ok(false);
        };
        if !records.iter().any(|r| r.room_id == room_id) {
            return Ok(false);
        }
        let mut next = map.clone();
        if let Some(records) = next.get_mut(&self.session_key) {
            records.retain(|r| r.room_id != room_id);
        }
        self.commit(&mut map, next)?;
        Ok(true)
    }

    /// Forgets every membership of this session.
    pub fn clear(&self) -> Result<(), RoomStoreError> {
        let mut map = self.write();
        let mut next = map.clone();
        next.remove(&self.session_key);
        self.commit(&mut map, next)
    }

    pub fn all_rooms(&self) -> BTreeSet<RoomId> {
        self.read()
            .get(&self.session_key)
            .map(|records| records.iter().map(|r| r.room_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<RoomMembershipRecord> {
        self.read()
            .get(&self.session_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes `next` to disk and only then makes it current. On error the
    /// cache keeps what the file holds.
    fn commit(&self, current: &mut Sessions, next: Sessions) -> Result<(), RoomStoreError> {
        self.persist(&next)?;
        *current = next;
        Ok(())
    }

    /// Writes all sessions to disk through a temporary file.
    fn persist(&self, map: &Sessions) -> Result<(), RoomStoreError> {
        let json = serde_json::to_string_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} session(s) to {:?}", map.len(), self.path);
        Ok(())
    }
}

fn load_sessions(path: &Path) -> Result<Sessions, RoomStoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let sessions: Sessions = serde_json::from_str(&data)?;
    debug!("loaded {} session(s) from {:?}", sessions.len(), path);
    Ok(sessions)
}

/// Returns the default room store path.
pub fn default_rooms_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("tether").join("client").join("rooms.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(session: &str) -> (tempfile::TempDir, RoomTracker) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rooms.json");
        let tracker = RoomTracker::open(path, session).unwrap();
        (tmp, tracker)
    }

    #[test]
    fn new_tracker_empty() {
        let (_tmp, rooms) = tracker("s1");
        assert!(rooms.all_rooms().is_empty());
        assert!(rooms.records().is_empty());
    }

    #[test]
    fn add_room_is_idempotent() {
        let (_tmp, rooms) = tracker("s1");
        assert!(rooms.add_room("a").unwrap());
        assert!(!rooms.add_room("a").unwrap());
        assert_eq!(rooms.all_rooms().len(), 1);
    }

    #[test]
    fn remove_room() {
        let (_tmp, rooms) = tracker("s1");
        rooms.add_room("a").unwrap();
        rooms.add_room("b").unwrap();
        assert!(rooms.remove_room("a").unwrap());
        assert!(!rooms.remove_room("a").unwrap());
        assert_eq!(rooms.all_rooms(), BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn memberships_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rooms.json");
        {
            let rooms = RoomTracker::open(path.clone(), "s1").unwrap();
            rooms.add_room("a").unwrap();
            rooms.add_room("b").unwrap();
        }
        let rooms = RoomTracker::open(path, "s1").unwrap();
        assert_eq!(
            rooms.all_rooms(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(rooms.records().iter().all(|r| r.joined_at <= Utc::now()));
    }

    #[test]
    fn sessions_share_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rooms.json");
        let first = RoomTracker::open(path.clone(), "s1").unwrap();
        first.add_room("a").unwrap();

        let second = RoomTracker::open(path.clone(), "s2").unwrap();
        assert!(second.all_rooms().is_empty());
        second.add_room("z").unwrap();

        let reopened = RoomTracker::open(path, "s1").unwrap();
        assert_eq!(reopened.all_rooms(), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn clear_forgets_session() {
        let (tmp, rooms) = tracker("s1");
        rooms.add_room("a").unwrap();
        rooms.clear().unwrap();
        assert!(rooms.all_rooms().is_empty());
        let reopened = RoomTracker::open(tmp.path().join("rooms.json"), "s1").unwrap();
        assert!(reopened.all_rooms().is_empty());
    }

    #[test]
    fn creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("deep").join("rooms.json");
        let rooms = RoomTracker::open(path.clone(), "s1").unwrap();
        rooms.add_room("a").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_membership_unrecorded() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let rooms = RoomTracker::open(blocker.join("rooms.json"), "s1").unwrap();

        assert!(matches!(rooms.add_room("a"), Err(RoomStoreError::Io(_))));
        assert!(rooms.all_rooms().is_empty());

        std::fs::remove_file(&blocker).unwrap();
        assert!(rooms.add_room("a").unwrap());
        let reopened = RoomTracker::open(blocker.join("rooms.json"), "s1").unwrap();
        assert_eq!(reopened.all_rooms(), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn failed_write_keeps_membership_on_remove() {
        let (tmp, rooms) = tracker("s1");
        rooms.add_room("a").unwrap();

        let path = tmp.path().join("rooms.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "").unwrap();

        assert!(rooms.remove_room("a").is_err());
        assert_eq!(rooms.all_rooms(), BTreeSet::from(["a".to_string()]));
        assert!(rooms.clear().is_err());
        assert_eq!(rooms.all_rooms().len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rooms.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            RoomTracker::open(path, "s1"),
            Err(RoomStoreError::Json(_))
        ));
    }
}
