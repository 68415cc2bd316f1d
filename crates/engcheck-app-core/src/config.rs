// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed settings persisted as JSON blobs through a storage port.
//!
//! Each settings type names its own key ([`Setting::KEY`]) and knows how to
//! validate itself; [`ConfigService`] only moves bytes and reports which key
//! failed.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Storage port for raw settings blobs.
pub trait ConfigStore {
    /// Bytes stored under `key`; [`ConfigError::NotFound`] when absent.
    fn read(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored under `key`.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), ConfigError>;
}

/// A settings document with a fixed storage key.
pub trait Setting: Serialize + DeserializeOwned + Default {
    /// Storage key.
    const KEY: &'static str;
    /// Reason a value is unusable.
    type Error: Display;

    /// Reject values the consumer cannot run with.
    fn validate(&self) -> Result<(), Self::Error>;

    /// `self` if valid, else [`ConfigError::Invalid`] naming the key.
    fn checked(self) -> Result<Self, ConfigError> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(err) => Err(ConfigError::Invalid {
                key: Self::KEY,
                reason: err.to_string(),
            }),
        }
    }
}

/// Settings persistence failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("no stored settings for `{0}`")]
    NotFound(String),
    /// Key cannot be mapped onto the store.
    #[error("invalid settings key {0:?}")]
    BadKey(String),
    /// Store has no location to write to.
    #[error("no settings directory available")]
    NoConfigDir,
    /// Underlying storage failed.
    #[error("settings storage: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not valid JSON for the type.
    #[error("stored settings for `{key}` are unreadable: {source}")]
    Decode {
        /// Key that failed.
        key: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },
    /// Value could not be serialized.
    #[error("settings could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    /// Value parsed but failed validation.
    #[error("invalid settings for `{key}`: {reason}")]
    Invalid {
        /// Key that failed.
        key: &'static str,
        /// Validation message.
        reason: String,
    },
}

/// Reads and writes [`Setting`]s through a [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct ConfigService<S> {
    store: S,
}

impl<S: ConfigStore> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stored value, or `None` when absent or empty.
    pub fn load<T: Setting>(&self) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.read(T::KEY) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConfigError::Decode {
                key: T::KEY.to_string(),
                source,
            })
    }

    /// Persist `value` as pretty JSON.
    pub fn save<T: Setting>(&self, value: &T) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(ConfigError::Encode)?;
        self.store.write(T::KEY, &bytes)
    }

    /// Stored value; on first use `T::default()` is written and returned.
    pub fn load_or_init<T: Setting>(&self) -> Result<T, ConfigError> {
        if let Some(value) = self.load()? {
            return Ok(value);
        }
        let value = T::default();
        self.save(&value)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde::Deserialize;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore(RefCell<HashMap<String, Vec<u8>>>);

    impl ConfigStore for MemStore {
        fn read(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| ConfigError::NotFound(key.to_string()))
        }

        fn write(&self, key: &str, bytes: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Probe {
        target: String,
        retries: u32,
    }

    impl Setting for Probe {
        const KEY: &'static str = "probe";
        type Error = String;

        fn validate(&self) -> Result<(), String> {
            if self.retries > 10 {
                return Err(format!("{} retries is too many", self.retries));
            }
            Ok(())
        }
    }

    #[test]
    fn absent_and_blank_blobs_load_as_none() {
        let svc = ConfigService::new(MemStore::default());
        assert_eq!(svc.load::<Probe>().unwrap(), None);
        svc.store().write("probe", b"  \n").unwrap();
        assert_eq!(svc.load::<Probe>().unwrap(), None);
    }

    #[test]
    fn defaults_are_written_once() {
        let svc = ConfigService::new(MemStore::default());
        let first: Probe = svc.load_or_init().unwrap();
        assert_eq!(first, Probe::default());
        assert!(svc.store().0.borrow().contains_key("probe"));

        svc.save(&Probe { target: "nec".into(), retries: 3 }).unwrap();
        let second: Probe = svc.load_or_init().unwrap();
        assert_eq!(second.retries, 3);
    }

    #[test]
    fn unreadable_blob_names_its_key() {
        let svc = ConfigService::new(MemStore::default());
        svc.store().write("probe", b"{not json").unwrap();
        let err = svc.load::<Probe>().unwrap_err();
        assert!(matches!(err, ConfigError::Decode { ref key, .. } if key == "probe"));
    }

    #[test]
    fn checked_wraps_validation_failure() {
        let bad = Probe { target: String::new(), retries: 40 };
        let err = bad.checked().unwrap_err();
        assert_eq!(err.to_string(), "invalid settings for `probe`: 40 retries is too many");
        assert!(Probe::default().checked().is_ok());
    }
}
