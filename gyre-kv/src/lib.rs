//! gyre-kv: a replicated key-value store over the gyre overlay.
//!
//! Each key lives on the ring member responsible for it and is replicated
//! to its successors. Writes pass a pluggable [`predicate::WritePredicate`]:
//! the shipped ed25519 predicate lets the first signed writer own a key,
//! after which only puts carrying the same signer verify. The store rides
//! the overlay's unicast channel under the `"kv"` payload tag.

pub mod persist;
pub mod predicate;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use gyre_overlay::keyspace::is_ordered;
use gyre_overlay::{AppHandler, Delivery, Key, Node, OverlayError};

use predicate::{SignedProof, WritePredicate};

/// Payload tag the store registers under.
pub const KV_APP: &str = "kv";

#[derive(Debug, Error)]
pub enum KvError {
    /// The signature is invalid or from a different signer than the owner.
    #[error("VERIFY_ERROR")]
    VerifyError,
    /// The key is owned by a signer and the put carried no signature.
    #[error("OVERWRITE_FORBIDDEN")]
    OverwriteForbidden,
    #[error("overlay: {0}")]
    Overlay(#[from] OverlayError),
    #[error("store error: {0}")]
    Store(String),
}

impl KvError {
    fn code(&self) -> String {
        match self {
            KvError::VerifyError => "VERIFY_ERROR".to_string(),
            KvError::OverwriteForbidden => "OVERWRITE_FORBIDDEN".to_string(),
            KvError::Overlay(e) => format!("OVERLAY: {e}"),
            KvError::Store(s) => s.clone(),
        }
    }

    fn from_code(code: &str) -> KvError {
        match code {
            "VERIFY_ERROR" => KvError::VerifyError,
            "OVERWRITE_FORBIDDEN" => KvError::OverwriteForbidden,
            other => KvError::Store(other.to_string()),
        }
    }
}

/// Messages carried in the overlay's `"kv"` payload channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvMessage {
    RawPut {
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proof: Option<SignedProof>,
    },
    RawPutReply {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RawGet {
        key: String,
    },
    RawGetReply {
        values: Vec<Value>,
    },
    /// Replica fetch: everything the receiver holds from `from` onward in
    /// its responsibility (the joiner's future range).
    RawGetReplica {
        from: String,
    },
    RawGetReplicaReply {
        entries: Vec<EntryRecord>,
    },
    /// Bulk replica push to a successor.
    RawReplicate {
        entries: Vec<EntryRecord>,
    },
    /// Single-key replica push after a put.
    RawReplicate1 {
        entry: EntryRecord,
    },
}

/// One key's stored state, as carried on the wire and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    values: Vec<Value>,
    /// Signer identity that owns the key, once a signed put landed.
    owner: Option<String>,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// How many successors receive replicas of each put.
    pub replication: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig { replication: 1 }
    }
}

pub struct KvStore {
    config: KvConfig,
    predicate: Arc<dyn WritePredicate>,
    /// Keys we are responsible for.
    entries: Mutex<HashMap<String, Entry>>,
    /// Keys we hold as a replica for a predecessor.
    replicas: Mutex<HashMap<String, Entry>>,
}

impl KvStore {
    /// Build the store and wire it into a node: registers the `"kv"`
    /// application handler and the join hook that pulls replicas from the
    /// new left neighbor.
    pub fn register(node: &Arc<Node>, config: KvConfig, predicate: Arc<dyn WritePredicate>) -> Arc<KvStore> {
        let store = Arc::new(KvStore {
            config,
            predicate,
            entries: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
        });
        node.register_app(KV_APP, Arc::clone(&store) as Arc<dyn AppHandler>);

        let hook_store = Arc::clone(&store);
        node.register_join_hook(Arc::new(move |node, ring, left_pc| {
            let store = Arc::clone(&hook_store);
            Box::pin(async move {
                store.prefetch_replicas(&node, &ring.key, &left_pc).await;
            })
        }));
        store
    }

    /// Build a store without wiring it to a node (tooling, tests).
    pub fn bare(config: KvConfig, predicate: Arc<dyn WritePredicate>) -> Arc<KvStore> {
        Arc::new(KvStore {
            config,
            predicate,
            entries: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
        })
    }

    // ── Client operations ────────────────────────────────────────

    /// Store `value` under `key` on the responsible node. A
    /// [`SignedProof`] claims (or re-asserts) ownership of the key.
    pub async fn put(
        &self,
        node: &Arc<Node>,
        key: &str,
        value: Value,
        proof: Option<SignedProof>,
    ) -> Result<(), KvError> {
        let msg = KvMessage::RawPut {
            key: key.to_string(),
            value,
            proof,
        };
        let reply = node
            .unicast(Key::from(key), KV_APP, serde_json::to_value(&msg).unwrap_or(Value::Null))
            .await?;
        match serde_json::from_value::<KvMessage>(reply) {
            Ok(KvMessage::RawPutReply { ok: true, .. }) => Ok(()),
            Ok(KvMessage::RawPutReply { error, .. }) => {
                Err(KvError::from_code(error.as_deref().unwrap_or("UNKNOWN")))
            }
            _ => Err(KvError::Store("malformed put reply".to_string())),
        }
    }

    /// Fetch the values stored under `key`.
    pub async fn get(&self, node: &Arc<Node>, key: &str) -> Result<Vec<Value>, KvError> {
        let msg = KvMessage::RawGet {
            key: key.to_string(),
        };
        let reply = node
            .unicast(Key::from(key), KV_APP, serde_json::to_value(&msg).unwrap_or(Value::Null))
            .await?;
        match serde_json::from_value::<KvMessage>(reply) {
            Ok(KvMessage::RawGetReply { values }) => Ok(values),
            _ => Err(KvError::Store("malformed get reply".to_string())),
        }
    }

    // ── Store logic ──────────────────────────────────────────────

    /// Apply a put locally: predicate first, then replace the values.
    pub(crate) fn apply_put(&self, key: &str, value: Value, proof: Option<&SignedProof>) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        let existing_owner = entries.get(key).and_then(|e| e.owner.clone());
        let new_owner = self
            .predicate
            .permit(existing_owner.as_deref(), proof, key, &value)?;
        let entry = entries.entry(key.to_string()).or_default();
        entry.values = vec![value];
        if new_owner.is_some() {
            entry.owner = new_owner;
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Vec<Value> {
        if let Some(entry) = self.entries.lock().get(key) {
            return entry.values.clone();
        }
        // Fall back to replicas: a predecessor may have just died.
        self.replicas
            .lock()
            .get(key)
            .map(|e| e.values.clone())
            .unwrap_or_default()
    }

    fn record_of(&self, key: &str, entry: &Entry) -> EntryRecord {
        EntryRecord {
            key: key.to_string(),
            values: entry.values.clone(),
            owner: entry.owner.clone(),
        }
    }

    /// Entries from `from` onward within our responsibility, for a joiner
    /// taking over that span.
    fn entries_from(&self, node: &Arc<Node>, local_key: &Key, from: &Key) -> Vec<EntryRecord> {
        let right = node
            .ring_node(local_key)
            .and_then(|ring| node.ring_right_pc(&ring))
            .and_then(|pc| pc.remote_key());
        let Some(right) = right else {
            return Vec::new();
        };
        self.entries
            .lock()
            .iter()
            .filter(|(k, _)| is_ordered(from, true, &Key::from(k.as_str()), &right, false))
            .map(|(k, e)| self.record_of(k, e))
            .collect()
    }

    /// Push a fresh entry to the responsible ring node's successors.
    fn replicate(&self, node: &Arc<Node>, local_key: &Key, record: EntryRecord) {
        if self.config.replication == 0 {
            return;
        }
        let Some(ring) = node.ring_node(local_key) else {
            return;
        };
        let successors: Vec<Key> = ring
            .successors()
            .into_iter()
            .filter(|k| *k != ring.key)
            .take(self.config.replication)
            .collect();
        for succ in successors {
            let node = Arc::clone(node);
            let msg = KvMessage::RawReplicate1 {
                entry: record.clone(),
            };
            tokio::spawn(async move {
                let payload = serde_json::to_value(&msg).unwrap_or(Value::Null);
                if let Err(e) = node.unicast(succ.clone(), KV_APP, payload).await {
                    tracing::debug!(succ = %succ, "replica push failed: {e}");
                }
            });
        }
    }

    /// Bulk-push every owned entry to the ring's successors. Run after
    /// restoring a snapshot, so replicas exist before the first put.
    pub async fn push_all_replicas(&self, node: &Arc<Node>, ring_key: &Key) {
        let entries = self.snapshot();
        if entries.is_empty() {
            return;
        }
        let Some(ring) = node.ring_node(ring_key) else {
            return;
        };
        let successors: Vec<Key> = ring
            .successors()
            .into_iter()
            .filter(|k| *k != ring.key)
            .take(self.config.replication)
            .collect();
        for succ in successors {
            let msg = KvMessage::RawReplicate {
                entries: entries.clone(),
            };
            let payload = serde_json::to_value(&msg).unwrap_or(Value::Null);
            if let Err(e) = node.unicast(succ.clone(), KV_APP, payload).await {
                tracing::debug!(succ = %succ, "bulk replica push failed: {e}");
            }
        }
    }

    /// Join hook: pull the entries we are about to become responsible for
    /// from the future left neighbor.
    async fn prefetch_replicas(
        &self,
        node: &Arc<Node>,
        our_key: &Key,
        left_pc: &Arc<gyre_overlay::PeerConnection>,
    ) {
        let Some(left_key) = left_pc.remote_key() else {
            return;
        };
        if left_key == *our_key {
            return;
        }
        let msg = KvMessage::RawGetReplica {
            from: our_key.as_str().to_string(),
        };
        let payload = serde_json::to_value(&msg).unwrap_or(Value::Null);
        match node.unicast(left_key.clone(), KV_APP, payload).await {
            Ok(reply) => {
                if let Ok(KvMessage::RawGetReplicaReply { entries }) =
                    serde_json::from_value::<KvMessage>(reply)
                {
                    let count = entries.len();
                    let mut ours = self.entries.lock();
                    for record in entries {
                        ours.insert(
                            record.key.clone(),
                            Entry {
                                values: record.values,
                                owner: record.owner,
                            },
                        );
                    }
                    if count > 0 {
                        tracing::info!(count, "took over entries from left neighbor");
                    }
                }
            }
            Err(e) => {
                tracing::debug!("replica prefetch failed: {e}");
            }
        }
    }

    /// Keys currently held as replicas for predecessors.
    pub fn replica_keys(&self) -> Vec<String> {
        self.replicas.lock().keys().cloned().collect()
    }

    /// Snapshot of the owned entries (persistence, tests).
    pub fn snapshot(&self) -> Vec<EntryRecord> {
        self.entries
            .lock()
            .iter()
            .map(|(k, e)| self.record_of(k, e))
            .collect()
    }

    pub(crate) fn restore(&self, records: Vec<EntryRecord>) {
        let mut entries = self.entries.lock();
        for record in records {
            entries.insert(
                record.key.clone(),
                Entry {
                    values: record.values,
                    owner: record.owner,
                },
            );
        }
    }
}

impl AppHandler for KvStore {
    fn on_receive(&self, node: &Arc<Node>, delivery: Delivery) -> Option<Value> {
        let msg = match serde_json::from_value::<KvMessage>(delivery.data.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("undecodable kv payload: {e}");
                return None;
            }
        };
        let reply = match msg {
            KvMessage::RawPut { key, value, proof } => {
                match self.apply_put(&key, value.clone(), proof.as_ref()) {
                    Ok(()) => {
                        let record = {
                            let entries = self.entries.lock();
                            entries.get(&key).map(|e| self.record_of(&key, e))
                        };
                        if let Some(record) = record {
                            self.replicate(node, &delivery.local_key, record);
                        }
                        KvMessage::RawPutReply {
                            ok: true,
                            error: None,
                        }
                    }
                    Err(e) => KvMessage::RawPutReply {
                        ok: false,
                        error: Some(e.code()),
                    },
                }
            }
            KvMessage::RawGet { key } => KvMessage::RawGetReply {
                values: self.lookup(&key),
            },
            KvMessage::RawGetReplica { from } => KvMessage::RawGetReplicaReply {
                entries: self.entries_from(node, &delivery.local_key, &Key::from(from.as_str())),
            },
            KvMessage::RawReplicate { entries } => {
                let mut replicas = self.replicas.lock();
                for record in entries {
                    replicas.insert(
                        record.key.clone(),
                        Entry {
                            values: record.values,
                            owner: record.owner,
                        },
                    );
                }
                return None;
            }
            KvMessage::RawReplicate1 { entry } => {
                self.replicas.lock().insert(
                    entry.key.clone(),
                    Entry {
                        values: entry.values,
                        owner: entry.owner,
                    },
                );
                return None;
            }
            // Reply variants arrive only as unicast responses.
            other => {
                tracing::debug!(?other, "kv reply variant outside a reply channel");
                return None;
            }
        };
        serde_json::to_value(&reply).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicate::{AllowAll, Ed25519Predicate, sign_put};

    fn unsigned_store() -> KvStore {
        KvStore {
            config: KvConfig::default(),
            predicate: Arc::new(AllowAll),
            entries: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
        }
    }

    fn signed_store() -> KvStore {
        KvStore {
            config: KvConfig::default(),
            predicate: Arc::new(Ed25519Predicate),
            entries: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn plain_put_and_get() {
        let store = unsigned_store();
        store.apply_put("000", Value::String("Hello".into()), None).unwrap();
        assert_eq!(store.lookup("000"), vec![Value::String("Hello".into())]);
        store.apply_put("000", Value::String("Bye".into()), None).unwrap();
        assert_eq!(store.lookup("000"), vec![Value::String("Bye".into())]);
    }

    #[test]
    fn signed_put_locks_the_key() {
        let store = signed_store();
        let mut rng = rand::thread_rng();
        let owner = ed25519_dalek::SigningKey::generate(&mut rng);
        let stranger = ed25519_dalek::SigningKey::generate(&mut rng);

        let value = Value::String("Hello".into());
        let proof = sign_put(&owner, "000", &value);
        store.apply_put("000", value.clone(), Some(&proof)).unwrap();

        // A different signer fails verification.
        let forged = sign_put(&stranger, "000", &value);
        let err = store
            .apply_put("000", value.clone(), Some(&forged))
            .unwrap_err();
        assert!(matches!(err, KvError::VerifyError), "got {err:?}");

        // No signature at all is an overwrite attempt.
        let err = store.apply_put("000", value.clone(), None).unwrap_err();
        assert!(matches!(err, KvError::OverwriteForbidden), "got {err:?}");

        // The owner can keep writing.
        let next = Value::String("Hello again".into());
        let proof = sign_put(&owner, "000", &next);
        store.apply_put("000", next, Some(&proof)).unwrap();
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let store = signed_store();
        let mut rng = rand::thread_rng();
        let owner = ed25519_dalek::SigningKey::generate(&mut rng);
        let value = Value::String("Hello".into());
        let mut proof = sign_put(&owner, "000", &value);
        proof.signature = proof.signature.to_lowercase(); // corrupt the b64
        let err = store.apply_put("000", value, Some(&proof)).unwrap_err();
        assert!(matches!(err, KvError::VerifyError));
    }

    #[test]
    fn replicas_serve_reads_as_fallback() {
        let store = unsigned_store();
        store.replicas.lock().insert(
            "abc".to_string(),
            Entry {
                values: vec![Value::from(42)],
                owner: None,
            },
        );
        assert_eq!(store.lookup("abc"), vec![Value::from(42)]);
    }

    #[test]
    fn kv_messages_round_trip() {
        let msg = KvMessage::RawPut {
            key: "000".into(),
            value: Value::String("Hello".into()),
            proof: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"raw_put\""));
        let back: KvMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, KvMessage::RawPut { .. }));
    }
}
