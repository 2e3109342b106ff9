//! Batch to payload serialization.
//!
//! [`JsonSerializer`] writes one JSON document per batch, with records grouped
//! by instrumentation scope in first-seen order:
//!
//! ```json
//! {"scopes":[{"scope":{"name":"http"},"records":[{...},{...}]}]}
//! ```

use crate::error::ExportError;
use crate::record::{Scope, TelemetryRecord};
use ringbatch::{Batch, ObjectPool, Pooled};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

/// Per-scope grouping containers kept between exports.
const MAX_POOLED_GROUPS: usize = 16;

/// What a serializer wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializeStats {
    pub records: usize,
    /// Records that failed to serialize and were left out.
    pub skipped: usize,
    pub bytes: usize,
}

/// Turns a batch into payload bytes.
pub trait Serializer<T>: Send + Sync {
    /// Appends the payload for `batch` to `out`.
    fn serialize(&self, batch: Batch<'_, T>, out: &mut Vec<u8>) -> Result<SerializeStats, ExportError>;
}

/// Records that know which instrumentation scope produced them.
pub trait ScopedRecord {
    fn scope(&self) -> &Scope;
}

impl ScopedRecord for TelemetryRecord {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// JSON payloads via `serde_json`, grouped by scope.
pub struct JsonSerializer<T> {
    groups: Arc<ObjectPool<Vec<T>>>,
    scratch: Arc<ObjectPool<Vec<u8>>>,
}

impl<T> JsonSerializer<T>
where
    T: ScopedRecord + Serialize + Send,
{
    pub fn new() -> Self {
        Self {
            groups: ObjectPool::new(MAX_POOLED_GROUPS),
            scratch: ObjectPool::new(1),
        }
    }

    /// Containers created so far; stays flat once the pool is warm.
    pub fn pooled_containers_created(&self) -> u64 {
        self.groups.created()
    }
}

impl<T> Default for JsonSerializer<T>
where
    T: ScopedRecord + Serialize + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: ScopedRecord + Serialize + Send,
{
    fn serialize(&self, batch: Batch<'_, T>, out: &mut Vec<u8>) -> Result<SerializeStats, ExportError> {
        let start = out.len();

        // Group by scope; a batch rarely spans more than a handful of scopes,
        // so a linear scan beats hashing.
        let mut groups: Vec<Pooled<Vec<T>>> = Vec::new();
        for item in batch {
            match groups.iter().position(|group| group[0].scope() == item.scope()) {
                Some(i) => groups[i].push(item),
                None => {
                    let mut group = self.groups.acquire();
                    group.push(item);
                    groups.push(group);
                }
            }
        }

        let mut stats = SerializeStats::default();
        let mut record = self.scratch.acquire();

        out.extend_from_slice(b"{\"scopes\":[");
        for (i, group) in groups.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(b"{\"scope\":");
            serde_json::to_writer(&mut *out, group[0].scope())
                .map_err(|e| ExportError::Serialization(e.to_string()))?;
            out.extend_from_slice(b",\"records\":[");

            let mut written = 0usize;
            for item in group.iter() {
                record.clear();
                if let Err(e) = serde_json::to_writer(&mut *record, item) {
                    stats.skipped += 1;
                    warn!(error = %e, scope = %group[0].scope().name, "skipping record that failed to serialize");
                    continue;
                }
                if written > 0 {
                    out.push(b',');
                }
                out.write_all(&record)
                    .map_err(|e| ExportError::Serialization(e.to_string()))?;
                written += 1;
            }
            stats.records += written;
            out.extend_from_slice(b"]}");
        }
        out.extend_from_slice(b"]}");

        stats.bytes = out.len() - start;
        Ok(stats)
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("pooled_groups", &self.groups.idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;

    fn record(scope: &str, name: &str) -> TelemetryRecord {
        TelemetryRecord::span(Scope::new(scope), name).with_ids(1, 2)
    }

    #[test]
    fn test_groups_records_by_scope_in_first_seen_order() {
        let serializer = JsonSerializer::new();
        let batch = Batch::from_vec(
            vec![record("db", "query"), record("http", "GET"), record("db", "commit")],
            3,
        )
        .unwrap();

        let mut out = Vec::new();
        let stats = serializer.serialize(batch, &mut out).unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.bytes, out.len());

        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let scopes = json["scopes"].as_array().unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0]["scope"]["name"], "db");
        assert_eq!(scopes[0]["records"][1]["name"], "commit");
        assert_eq!(scopes[1]["scope"]["name"], "http");
    }

    #[test]
    fn test_empty_batch_is_valid_document() {
        let serializer = JsonSerializer::<TelemetryRecord>::new();
        let mut out = Vec::new();
        let stats = serializer.serialize(Batch::default(), &mut out).unwrap();
        assert_eq!(stats.records, 0);
        assert_eq!(out, b"{\"scopes\":[]}");
    }

    #[test]
    fn test_group_containers_are_reused() {
        let serializer = JsonSerializer::new();
        let mut out = Vec::new();
        for _ in 0..5 {
            out.clear();
            let batch = Batch::from_vec(vec![record("a", "x"), record("b", "y")], 2).unwrap();
            serializer.serialize(batch, &mut out).unwrap();
        }
        assert_eq!(serializer.pooled_containers_created(), 2);
    }

    struct Flaky {
        scope: Scope,
        ok: bool,
    }

    impl ScopedRecord for Flaky {
        fn scope(&self) -> &Scope {
            &self.scope
        }
    }

    impl Serialize for Flaky {
        fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            if self.ok {
                s.serialize_str("ok")
            } else {
                Err(S::Error::custom("unrepresentable"))
            }
        }
    }

    #[test]
    fn test_failing_record_is_skipped_not_the_batch() {
        let serializer = JsonSerializer::new();
        let scope = Scope::new("s");
        let items = vec![
            Flaky { scope: scope.clone(), ok: true },
            Flaky { scope: scope.clone(), ok: false },
            Flaky { scope, ok: true },
        ];

        let mut out = Vec::new();
        let stats = serializer
            .serialize(Batch::from_vec(items, 3).unwrap(), &mut out)
            .unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.skipped, 1);

        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["scopes"][0]["records"], serde_json::json!(["ok", "ok"]));
    }
}
