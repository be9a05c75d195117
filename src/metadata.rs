/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! UUID-keyed key/value property store with change notifications. The
//! store survives server restarts through a JSON file in the server
//! directory; everything else about the engine is ephemeral.

use crate::formats::Uuid;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{fs, io, path::PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyChangeKind {
    Created,
    Changed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub subject: Uuid,
    pub key: String,
    pub value: String,
    /// MIME type or URI describing the value encoding; empty means UTF-8
    /// text.
    pub value_type: Option<String>,
}

pub struct MetadataStore {
    properties: DashMap<(Uuid, String), (String, Option<String>)>,
    persist_path: Option<PathBuf>,
}

impl MetadataStore {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let store = Self {
            properties: DashMap::new(),
            persist_path,
        };
        store.load();
        store
    }

    fn load(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<Property>>(&content) {
                Ok(properties) => {
                    for p in properties {
                        self.properties
                            .insert((p.subject, p.key), (p.value, p.value_type));
                    }
                    debug!(
                        "Loaded {} metadata properties from {}",
                        self.properties.len(),
                        path.to_string_lossy()
                    );
                }
                Err(e) => warn!("Ignoring malformed metadata store: {e}"),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not read metadata store: {e}"),
        }
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let properties: Vec<Property> = self
            .properties
            .iter()
            .map(|entry| Property {
                subject: entry.key().0,
                key: entry.key().1.clone(),
                value: entry.value().0.clone(),
                value_type: entry.value().1.clone(),
            })
            .collect();
        match serde_json::to_string_pretty(&properties) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!("Could not persist metadata store: {e}");
                }
            }
            Err(e) => warn!("Could not serialize metadata store: {e}"),
        }
    }

    pub fn set_property(
        &self,
        subject: Uuid,
        key: &str,
        value: &str,
        value_type: Option<&str>,
    ) -> PropertyChangeKind {
        let previous = self.properties.insert(
            (subject, key.to_owned()),
            (value.to_owned(), value_type.map(ToOwned::to_owned)),
        );
        self.persist();
        if previous.is_some() {
            PropertyChangeKind::Changed
        } else {
            PropertyChangeKind::Created
        }
    }

    pub fn get_property(&self, subject: Uuid, key: &str) -> Option<(String, Option<String>)> {
        self.properties
            .get(&(subject, key.to_owned()))
            .map(|entry| entry.value().clone())
    }

    pub fn get_properties(&self, subject: Uuid) -> Vec<Property> {
        self.properties
            .iter()
            .filter(|entry| entry.key().0 == subject)
            .map(|entry| Property {
                subject,
                key: entry.key().1.clone(),
                value: entry.value().0.clone(),
                value_type: entry.value().1.clone(),
            })
            .collect()
    }

    pub fn get_all_properties(&self) -> Vec<Property> {
        self.properties
            .iter()
            .map(|entry| Property {
                subject: entry.key().0,
                key: entry.key().1.clone(),
                value: entry.value().0.clone(),
                value_type: entry.value().1.clone(),
            })
            .collect()
    }

    pub fn remove_property(&self, subject: Uuid, key: &str) -> bool {
        let removed = self
            .properties
            .remove(&(subject, key.to_owned()))
            .is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Removes all properties of one subject, returns how many were
    /// dropped.
    pub fn remove_properties(&self, subject: Uuid) -> u32 {
        let keys: Vec<(Uuid, String)> = self
            .properties
            .iter()
            .filter(|entry| entry.key().0 == subject)
            .map(|entry| entry.key().clone())
            .collect();
        let count = keys.len() as u32;
        for key in keys {
            self.properties.remove(&key);
        }
        if count > 0 {
            self.persist();
        }
        count
    }

    pub fn remove_all_properties(&self) {
        self.properties.clear();
        self.persist();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> MetadataStore {
        MetadataStore::new(None)
    }

    #[test]
    fn set_get_round_trip_works() {
        let store = store();
        let subject = Uuid(42);
        assert_eq!(
            store.set_property(subject, "pretty-name", "Left", None),
            PropertyChangeKind::Created
        );
        assert_eq!(
            store.set_property(subject, "pretty-name", "Right", Some("text/plain")),
            PropertyChangeKind::Changed
        );
        assert_eq!(
            store.get_property(subject, "pretty-name"),
            Some(("Right".to_owned(), Some("text/plain".to_owned())))
        );
    }

    #[test]
    fn remove_properties_empties_subject() {
        let store = store();
        let subject = Uuid(7);
        store.set_property(subject, "a", "1", None);
        store.set_property(subject, "b", "2", None);
        store.set_property(Uuid(8), "c", "3", None);
        assert_eq!(store.remove_properties(subject), 2);
        assert!(store.get_properties(subject).is_empty());
        assert_eq!(store.get_all_properties().len(), 1);
    }

    #[test]
    fn persistence_round_trip_works() {
        let path = std::env::temp_dir().join(format!(
            "jackd-rs-metadata-test-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let store = MetadataStore::new(Some(path.clone()));
        store.set_property(Uuid(1), "key", "value", None);
        drop(store);

        let reloaded = MetadataStore::new(Some(path.clone()));
        assert_eq!(
            reloaded.get_property(Uuid(1), "key"),
            Some(("value".to_owned(), None))
        );
        let _ = fs::remove_file(&path);
    }
}
