//! Per-device key-value storage for the master token and viewing
//! preferences.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::room_id::RoomId;

pub const LAST_ROOM_KEY: &str = "last-room-id";
pub const TEXT_SIZE_KEY: &str = "text-size";

pub const DEFAULT_TEXT_SIZE: f64 = 1.0;
pub const TEXT_SIZE_RANGE: (f64, f64) = (0.5, 2.0);
pub const TRANSPOSE_RANGE: (i32, i32) = (-11, 11);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("store file is not a JSON object of strings: {0}")]
    Format(#[from] serde_json::Error),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Whole-file JSON object, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, treating a missing file as empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

fn master_token_key(room: &RoomId) -> String {
    format!("master-token-{room}")
}

fn transpose_key(room: &RoomId, song_id: &str) -> String {
    format!("transpose-{room}-{song_id}")
}

/// Typed accessors over a [`KeyValueStore`].
pub struct Preferences<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> Preferences<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    pub fn master_token(&self, room: &RoomId) -> Option<String> {
        self.store.get(&master_token_key(room)).filter(|t| !t.is_empty())
    }

    pub fn set_master_token(&self, room: &RoomId, token: &str) -> Result<(), StoreError> {
        self.store.set(&master_token_key(room), token)
    }

    pub fn forget_master_token(&self, room: &RoomId) -> Result<(), StoreError> {
        self.store.remove(&master_token_key(room))
    }

    pub fn last_room(&self) -> Option<RoomId> {
        self.store
            .get(LAST_ROOM_KEY)
            .and_then(|raw| RoomId::parse(&raw).ok())
    }

    pub fn set_last_room(&self, room: &RoomId) -> Result<(), StoreError> {
        self.store.set(LAST_ROOM_KEY, room.as_str())
    }

    pub fn transpose(&self, room: &RoomId, song_id: &str) -> i32 {
        self.store
            .get(&transpose_key(room, song_id))
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .map(clamp_transpose)
            .unwrap_or(0)
    }

    pub fn set_transpose(
        &self,
        room: &RoomId,
        song_id: &str,
        semitones: i32,
    ) -> Result<(), StoreError> {
        self.store.set(
            &transpose_key(room, song_id),
            &clamp_transpose(semitones).to_string(),
        )
    }

    pub fn text_size(&self) -> f64 {
        self.store
            .get(TEXT_SIZE_KEY)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|size| size.is_finite())
            .map(clamp_text_size)
            .unwrap_or(DEFAULT_TEXT_SIZE)
    }

    pub fn set_text_size(&self, size: f64) -> Result<(), StoreError> {
        let size = if size.is_finite() { clamp_text_size(size) } else { DEFAULT_TEXT_SIZE };
        self.store.set(TEXT_SIZE_KEY, &size.to_string())
    }
}

fn clamp_transpose(semitones: i32) -> i32 {
    semitones.clamp(TRANSPOSE_RANGE.0, TRANSPOSE_RANGE.1)
}

fn clamp_text_size(size: f64) -> f64 {
    size.clamp(TEXT_SIZE_RANGE.0, TEXT_SIZE_RANGE.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("ABCD").unwrap()
    }

    #[test_timeout::timeout]
    fn master_token_round_trip_and_forget() {
        let store = MemoryStore::new();
        let prefs = Preferences::new(&store);
        assert_eq!(prefs.master_token(&room()), None);
        prefs.set_master_token(&room(), "tok").unwrap();
        assert_eq!(prefs.master_token(&room()).as_deref(), Some("tok"));
        prefs.forget_master_token(&room()).unwrap();
        assert_eq!(prefs.master_token(&room()), None);
    }

    #[test_timeout::timeout]
    fn preferences_are_clamped() {
        let store = MemoryStore::new();
        let prefs = Preferences::new(&store);
        assert_eq!(prefs.text_size(), DEFAULT_TEXT_SIZE);
        prefs.set_text_size(3.5).unwrap();
        assert_eq!(prefs.text_size(), 2.0);
        store.set(TEXT_SIZE_KEY, "0.1").unwrap();
        assert_eq!(prefs.text_size(), 0.5);
        store.set(TEXT_SIZE_KEY, "huge").unwrap();
        assert_eq!(prefs.text_size(), DEFAULT_TEXT_SIZE);

        assert_eq!(prefs.transpose(&room(), "song-1"), 0);
        prefs.set_transpose(&room(), "song-1", -20).unwrap();
        assert_eq!(prefs.transpose(&room(), "song-1"), -11);
    }

    #[test_timeout::timeout]
    fn last_room_ignores_garbage() {
        let store = MemoryStore::new();
        let prefs = Preferences::new(&store);
        store.set(LAST_ROOM_KEY, "not a room").unwrap();
        assert_eq!(prefs.last_room(), None);
        prefs.set_last_room(&room()).unwrap();
        assert_eq!(prefs.last_room(), Some(room()));
    }

    #[test_timeout::timeout]
    fn json_file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("setlist-store-{}", std::process::id()));
        let path = dir.join("prefs.json");
        let _ = fs::remove_file(&path);

        let store = JsonFileStore::open(&path).unwrap();
        Preferences::new(&store).set_master_token(&room(), "persisted").unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            Preferences::new(&reopened).master_token(&room()).as_deref(),
            Some("persisted")
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
