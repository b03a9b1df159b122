//! Encryption provider cache: one client per (connection, KMS/key-vault
//! configuration), one data-key record per (client, alias).
//!
//! Both caches are demand-driven and shared across threads. A
//! lookup-or-create on a given cache key is atomic with respect to other
//! lookups on the same key (per-key lock slots); lookups on distinct
//! keys proceed independently. Creation failures are never cached as
//! negative results, so a later operation retries.

use crate::client::{ClientFactory, ClientOptions, DataKeyOptions, EncryptionClient, KeyRecord};
use crate::error::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of encryption clients and their data keys.
///
/// Owned by the connection context (typically shared by every encrypted
/// collection of one connection via `Arc`); lives as long as it does.
pub struct ProviderRegistry {
    factory: Arc<dyn ClientFactory>,
    slots: Mutex<HashMap<String, Arc<ClientSlot>>>,
}

/// Cache slot for one canonicalized (connection, configuration) pair.
struct ClientSlot {
    client: Mutex<Option<Arc<dyn EncryptionClient>>>,
    vault_loaded: Mutex<bool>,
    records: Mutex<HashMap<String, KeyRecord>>,
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClientSlot {
    fn new() -> Self {
        Self {
            client: Mutex::new(None),
            vault_loaded: Mutex::new(false),
            records: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        }
    }
}

impl ProviderRegistry {
    /// Creates a registry backed by the given client factory.
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory, slots: Mutex::new(HashMap::new()) }
    }

    /// Returns the memoized client for a (connection, configuration)
    /// pair, creating it on first request.
    ///
    /// Equivalent configurations with differently ordered keys hit the
    /// same cache entry: the cache key is an order-insensitive canonical
    /// serialization.
    ///
    /// # Errors
    ///
    /// Propagates factory failures; nothing is cached on failure.
    pub fn client(
        &self,
        connection: &str,
        options: &ClientOptions,
    ) -> Result<Arc<dyn EncryptionClient>> {
        let slot = self.slot(connection, options);
        self.client_for(&slot, connection, options)
    }

    /// Returns the memoized data-key record for `(client, alias)`.
    ///
    /// On first access for a client this bulk-loads every existing
    /// vault record (keyed by every alias each record owns) in one
    /// vault read. A record still absent after the load is created via
    /// the client, registered under the alias, and returned; at most
    /// one creation per `(client, alias)` is in flight at a time.
    ///
    /// # Errors
    ///
    /// Propagates vault-read and key-creation failures.
    pub fn data_key(
        &self,
        connection: &str,
        options: &ClientOptions,
        provider: &str,
        master_key: Option<&Value>,
        alias: &str,
    ) -> Result<KeyRecord> {
        let slot = self.slot(connection, options);
        let client = self.client_for(&slot, connection, options)?;

        self.ensure_vault_loaded(&slot, &client)?;

        if let Some(record) = slot.records.lock().get(alias) {
            return Ok(record.clone());
        }

        // Single-flight creation per alias; other aliases stay unblocked.
        let gate = {
            let mut creating = slot.creating.lock();
            Arc::clone(creating.entry(alias.to_string()).or_default())
        };
        let _guard = gate.lock();

        if let Some(record) = slot.records.lock().get(alias) {
            return Ok(record.clone());
        }

        debug!(alias, provider, "creating data key");
        let key_options = DataKeyOptions {
            master_key: master_key.cloned(),
            key_alt_names: vec![alias.to_string()],
        };
        let id = client.create_data_key(provider, &key_options)?;
        let record = KeyRecord {
            id,
            key_alt_names: vec![alias.to_string()],
            master_key: master_key.cloned(),
        };
        slot.records.lock().insert(alias.to_string(), record.clone());
        Ok(record)
    }

    /// Clears both caches. Intended for test isolation only.
    pub fn reset(&self) {
        self.slots.lock().clear();
    }

    fn slot(&self, connection: &str, options: &ClientOptions) -> Arc<ClientSlot> {
        let key = cache_key(connection, options);
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key).or_insert_with(|| Arc::new(ClientSlot::new())))
    }

    fn client_for(
        &self,
        slot: &ClientSlot,
        connection: &str,
        options: &ClientOptions,
    ) -> Result<Arc<dyn EncryptionClient>> {
        let mut cell = slot.client.lock();
        if let Some(client) = cell.as_ref() {
            return Ok(Arc::clone(client));
        }
        debug!(connection, "creating encryption client");
        let client = self.factory.create(options)?;
        *cell = Some(Arc::clone(&client));
        Ok(client)
    }

    fn ensure_vault_loaded(
        &self,
        slot: &ClientSlot,
        client: &Arc<dyn EncryptionClient>,
    ) -> Result<()> {
        let mut loaded = slot.vault_loaded.lock();
        if *loaded {
            return Ok(());
        }
        let existing = client.vault_keys()?;
        let mut records = slot.records.lock();
        for record in existing {
            for alias in &record.key_alt_names {
                records.insert(alias.clone(), record.clone());
            }
        }
        *loaded = true;
        Ok(())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("clients", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}

fn cache_key(connection: &str, options: &ClientOptions) -> String {
    let mut key = String::from(connection);
    key.push('\u{1f}');
    key.push_str(&options.key_vault_namespace.clone().unwrap_or_default());
    key.push('\u{1f}');
    match &options.kms_providers {
        Some(value) => canonical_json(value, &mut key),
        None => key.push_str("null"),
    }
    key
}

/// Serializes a JSON value with object keys in sorted order at every
/// level, so equivalent configurations map to equal strings.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
