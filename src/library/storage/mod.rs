//! Crash-safe persistence for small per-component state blobs
//!
//! State is stored as one JSON file per key inside a dedicated directory with
//! restrictive permissions. Every file wraps its payload in a version
//! envelope so that the schema can evolve without byte-level sniffing: on
//! load, older payloads are routed through the owning type's upgrade table
//! one version at a time until they match the current schema. Files written
//! before the envelope was introduced carry a bare payload and are treated as
//! version zero.
//!
//! Writes go to a dot-prefixed temporary file in the same directory which is
//! then renamed over the final path, so a crash mid-write leaves the previous
//! state intact.

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const ENVELOPE_VERSION_FIELD: &str = "version";
const ENVELOPE_PAYLOAD_FIELD: &str = "payload";
const STATE_FILE_EXTENSION: &str = "state";

const DIRECTORY_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Failure while loading or persisting state
#[derive(Debug, Error)]
pub enum StateError {
    /// The state directory could not be created or accessed
    #[error("state directory '{path}' is not usable")]
    Directory {
        /// Directory that was requested
        path: PathBuf,
        /// Underlying filesystem error
        #[source]
        source: io::Error,
    },
    /// Reading or writing a state file failed
    #[error("state file i/o failed")]
    Io(#[from] io::Error),
    /// The file exists but does not contain the expected structure
    #[error("persisted state is corrupt")]
    Corrupt(#[source] serde_json::Error),
    /// The file was written by a newer version of this software
    #[error("persisted state version {found} is newer than the supported version {supported}")]
    FutureVersion {
        /// Version found in the envelope
        found: u32,
        /// Latest version this build understands
        supported: u32,
    },
    /// The upgrade table has no entry for the persisted version
    #[error("no upgrade path from state version {0}")]
    NoUpgradePath(u32),
}

/// Persistable state with a schema version and an upgrade table
pub trait StateSchema: Serialize + DeserializeOwned {
    /// Current schema version, incremented on every breaking layout change
    const VERSION: u32;

    /// Converts a payload written at `version` into the layout of `version + 1`
    ///
    /// Version zero denotes files written before the envelope was introduced.
    fn upgrade(version: u32, payload: Value) -> Result<Value, StateError> {
        let _ = payload;
        Err(StateError::NoUpgradePath(version))
    }
}

/// Identifier of a state blob within a [`StateStore`]
///
/// Keys derive their file name from the owning module path and a stable name
/// so that two components sharing a state directory can never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKey {
    file_name: String,
}

impl StateKey {
    /// Creates a key for the given module path and name
    pub fn new(module_path: &str, name: &str) -> Self {
        let sanitize = |input: &str| input.replace(&['/', '\\', ' '][..], "_");

        Self {
            file_name: format!(
                "{}.{}.{}",
                sanitize(module_path),
                sanitize(name),
                STATE_FILE_EXTENSION
            ),
        }
    }

    /// File name the key maps to, relative to the state directory
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name)
    }
}

/// Directory-backed store for [`StateSchema`] values
pub struct StateStore {
    directory: PathBuf,
}

impl StateStore {
    /// Opens the store, creating the directory with owner-only permissions
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StateError> {
        let directory = directory.into();

        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIRECTORY_MODE)
            .create(&directory)
            .map_err(|source| StateError::Directory {
                path: directory.clone(),
                source,
            })?;

        Ok(Self { directory })
    }

    /// Loads the state stored under the key
    ///
    /// A missing file yields `Ok(None)` since a component running for the
    /// first time has no state yet. Every other failure is surfaced because
    /// continuing with a half-read state would corrupt downstream data.
    pub fn load<S: StateSchema>(&self, key: &StateKey) -> Result<Option<S>, StateError> {
        let path = self.path_for(key);

        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let value: Value = serde_json::from_slice(&raw).map_err(StateError::Corrupt)?;
        let (mut version, mut payload) = split_envelope(value);

        if version > S::VERSION {
            return Err(StateError::FutureVersion {
                found: version,
                supported: S::VERSION,
            });
        }

        while version < S::VERSION {
            payload = S::upgrade(version, payload)?;
            version += 1;
        }

        let state = serde_json::from_value(payload).map_err(StateError::Corrupt)?;

        Ok(Some(state))
    }

    /// Loads the state stored under the key, falling back to the default
    pub fn load_or_default<S: StateSchema + Default>(
        &self,
        key: &StateKey,
    ) -> Result<S, StateError> {
        match self.load(key)? {
            Some(state) => Ok(state),
            None => {
                warn!(
                    "No previous state found for '{}', starting from the default",
                    key
                );
                Ok(S::default())
            }
        }
    }

    /// Persists the state under the key, replacing any previous value atomically
    pub fn save<S: StateSchema>(&self, key: &StateKey, state: &S) -> Result<(), StateError> {
        let envelope = serde_json::json!({
            ENVELOPE_VERSION_FIELD: S::VERSION,
            ENVELOPE_PAYLOAD_FIELD: state,
        });

        let serialized = serde_json::to_vec_pretty(&envelope).map_err(StateError::Corrupt)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let temporary = self
            .directory
            .join(format!(".{}.{}.tmp", key.file_name, nanos));

        fs::write(&temporary, serialized)?;
        fs::set_permissions(&temporary, fs::Permissions::from_mode(FILE_MODE))?;
        fs::rename(&temporary, self.path_for(key))?;

        Ok(())
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.directory.join(&key.file_name)
    }

    /// Directory backing this store
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Splits a raw value into its envelope version and payload
///
/// Values without an envelope are bare payloads from before versioning was
/// introduced and report version zero.
fn split_envelope(value: Value) -> (u32, Value) {
    match value {
        Value::Object(mut map)
            if map.contains_key(ENVELOPE_VERSION_FIELD)
                && map.contains_key(ENVELOPE_PAYLOAD_FIELD) =>
        {
            let version = map
                .get(ENVELOPE_VERSION_FIELD)
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32;
            let payload = map.remove(ENVELOPE_PAYLOAD_FIELD).unwrap_or(Value::Null);

            (version, payload)
        }
        other => (0, other),
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        count: u64,
        label: String,
    }

    impl StateSchema for CounterState {
        const VERSION: u32 = 2;

        fn upgrade(version: u32, payload: Value) -> Result<Value, StateError> {
            match version {
                // The original format stored a bare number
                0 => Ok(serde_json::json!({ "total": payload })),
                1 => {
                    let count = payload.get("total").cloned().unwrap_or(Value::Null);
                    Ok(serde_json::json!({ "count": count, "label": "upgraded" }))
                }
                other => Err(StateError::NoUpgradePath(other)),
            }
        }
    }

    fn temporary_store() -> StateStore {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let directory = env::temp_dir().join(format!("state-store-test-{}", nanos));

        StateStore::open(directory).unwrap()
    }

    #[test]
    fn round_trip_state() {
        let store = temporary_store();
        let key = StateKey::new("tests", "counter");
        let state = CounterState {
            count: 7,
            label: "hello".into(),
        };

        store.save(&key, &state).unwrap();

        assert_eq!(store.load::<CounterState>(&key).unwrap(), Some(state));
    }

    #[test]
    fn fall_back_to_the_default_when_missing() {
        let store = temporary_store();
        let key = StateKey::new("tests", "missing");

        assert_eq!(
            store.load_or_default::<CounterState>(&key).unwrap(),
            CounterState::default()
        );
    }

    #[test]
    fn upgrade_legacy_payloads() {
        let store = temporary_store();
        let key = StateKey::new("tests", "legacy");

        // A bare payload written before envelopes existed
        fs::write(store.directory().join(key.file_name()), b"42").unwrap();

        assert_eq!(
            store.load::<CounterState>(&key).unwrap(),
            Some(CounterState {
                count: 42,
                label: "upgraded".into()
            })
        );
    }

    #[test]
    fn reject_corrupt_files() {
        let store = temporary_store();
        let key = StateKey::new("tests", "corrupt");

        fs::write(store.directory().join(key.file_name()), b"{not json").unwrap();

        assert!(matches!(
            store.load::<CounterState>(&key),
            Err(StateError::Corrupt(_))
        ));
    }

    #[test]
    fn reject_future_versions() {
        let store = temporary_store();
        let key = StateKey::new("tests", "future");

        fs::write(
            store.directory().join(key.file_name()),
            br#"{ "version": 99, "payload": {} }"#,
        )
        .unwrap();

        assert!(matches!(
            store.load::<CounterState>(&key),
            Err(StateError::FutureVersion {
                found: 99,
                supported: 2
            })
        ));
    }

    #[test]
    fn keep_keys_of_different_components_apart() {
        assert_eq!(
            StateKey::new("pipeline::feed", "abuse.ch").file_name(),
            "pipeline::feed.abuse.ch.state"
        );
        assert!(StateKey::new("a/b", "c d").file_name().contains("a_b.c_d"));
    }
}
