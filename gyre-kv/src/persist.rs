//! Snapshot persistence: the per-key map as a tagged JSON-lines stream.
//!
//! The first record is a header carrying the format version and save
//! time; every following line is one key's entry. Unknown record tags are
//! skipped on load so newer writers stay readable.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{EntryRecord, KvError, KvStore};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Header {
        version: u32,
        saved_at: chrono::DateTime<chrono::Utc>,
    },
    Entry(EntryRecord),
}

/// Write the store's owned entries to `path`, atomically via a sibling
/// temp file.
pub fn save(store: &Arc<KvStore>, path: &Path) -> Result<(), KvError> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)
        .map_err(|e| KvError::Store(format!("create {}: {e}", tmp.display())))?;
    let mut write_line = |record: &Record| -> Result<(), KvError> {
        let line = serde_json::to_string(record)
            .map_err(|e| KvError::Store(format!("encode record: {e}")))?;
        writeln!(file, "{line}").map_err(|e| KvError::Store(format!("write: {e}")))
    };
    write_line(&Record::Header {
        version: FORMAT_VERSION,
        saved_at: chrono::Utc::now(),
    })?;
    for entry in store.snapshot() {
        write_line(&Record::Entry(entry))?;
    }
    file.sync_all()
        .map_err(|e| KvError::Store(format!("sync: {e}")))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| KvError::Store(format!("rename: {e}")))?;
    Ok(())
}

/// Load a snapshot into the store. Missing files are an empty store, not
/// an error.
pub fn load(store: &Arc<KvStore>, path: &Path) -> Result<usize, KvError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(KvError::Store(format!("open {}: {e}", path.display()))),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| KvError::Store(format!("read: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(Record::Header { version, .. }) => {
                if version > FORMAT_VERSION {
                    return Err(KvError::Store(format!(
                        "snapshot version {version} is newer than supported {FORMAT_VERSION}"
                    )));
                }
            }
            Ok(Record::Entry(entry)) => entries.push(entry),
            Err(e) => {
                tracing::warn!("skipping undecodable snapshot line: {e}");
            }
        }
    }
    let count = entries.len();
    store.restore(entries);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KvConfig, predicate::AllowAll};
    use serde_json::Value;

    fn store() -> Arc<KvStore> {
        KvStore::bare(KvConfig::default(), Arc::new(AllowAll))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("gyre-kv-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.jsonl");

        let a = store();
        a.apply_put("k1", Value::String("v1".into()), None).unwrap();
        a.apply_put("k2", Value::from(7), None).unwrap();
        save(&a, &path).unwrap();

        let b = store();
        let count = load(&b, &path).unwrap();
        assert_eq!(count, 2);
        assert_eq!(b.snapshot().len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_loads_empty() {
        let b = store();
        let count = load(&b, Path::new("/nonexistent/gyre-kv-snapshot.jsonl")).unwrap();
        assert_eq!(count, 0);
    }
}
