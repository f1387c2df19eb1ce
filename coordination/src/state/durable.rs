//! RocksDB-backed durable ContactStore
//!
//! Provides persistent storage with column families for logical data separation.
//! Values are stored as JSON so records stay readable with stock RocksDB tooling.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, ALL_CFS};
use super::store::{ContactStore, SharedContactStore, StoreError, StoreResult};
use super::types::{Contact, ContactId, PatternStat, TransitionRecord};

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// RocksDB-backed persistent contact store
pub struct DurableContactStore {
    db: DB,
    path: PathBuf,
    create_guard: Mutex<()>,
}

impl DurableContactStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db,
            path,
            create_guard: Mutex::new(()),
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedContactStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::NotFound(format!("column family {}", name)))
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.put_cf(self.cf(cf_name)?, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        match self.db.get_cf(self.cf(cf_name)?, key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let iter = self.db.iterator_cf(
            self.cf(cf_name)?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(
                serde_json::from_slice(&value)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?,
            );
        }
        Ok(values)
    }
}

#[async_trait]
impl ContactStore for DurableContactStore {
    async fn get_contact(&self, id: &ContactId) -> StoreResult<Option<Contact>> {
        self.get(schema::CF_CONTACTS, &schema::keys::contact(id.as_str()))
    }

    async fn put_contact(&self, contact: &Contact) -> StoreResult<()> {
        self.put(
            schema::CF_CONTACTS,
            &schema::keys::contact(contact.contact_id.as_str()),
            contact,
        )
    }

    async fn insert_contact_if_absent(&self, contact: &Contact) -> StoreResult<Contact> {
        let _guard = self.create_guard.lock().unwrap_or_else(|e| e.into_inner());
        let key = schema::keys::contact(contact.contact_id.as_str());
        if let Some(existing) = self.get(schema::CF_CONTACTS, &key)? {
            return Ok(existing);
        }
        self.put(schema::CF_CONTACTS, &key, contact)?;
        Ok(contact.clone())
    }

    async fn append_transition(&self, record: &TransitionRecord) -> StoreResult<()> {
        let id = record.id.to_string();
        self.put(
            schema::CF_TRANSITIONS,
            &schema::keys::transition(record.contact_id.as_str(), record.decided_at, &id),
            record,
        )?;
        self.put(
            schema::CF_TIMELINE,
            &schema::keys::timeline(record.decided_at, &id),
            record,
        )
    }

    async fn transitions_for(&self, id: &ContactId) -> StoreResult<Vec<TransitionRecord>> {
        self.scan_prefix(
            schema::CF_TRANSITIONS,
            &schema::keys::transition_prefix(id.as_str()),
        )
    }

    async fn transitions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TransitionRecord>> {
        let start_key = schema::keys::timeline_start(start);
        let iter = self.db.iterator_cf(
            self.cf(schema::CF_TIMELINE)?,
            IteratorMode::From(start_key.as_bytes(), Direction::Forward),
        );

        let mut records = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let record: TransitionRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if record.decided_at >= end {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn put_pattern(&self, stat: &PatternStat) -> StoreResult<()> {
        self.put(
            schema::CF_PATTERNS,
            &schema::keys::pattern(
                stat.key.signal_type.as_str(),
                &stat.key.target_agent.to_string(),
            ),
            stat,
        )
    }

    async fn load_patterns(&self) -> StoreResult<Vec<PatternStat>> {
        self.scan_prefix(schema::CF_PATTERNS, "pattern:")
    }
}
