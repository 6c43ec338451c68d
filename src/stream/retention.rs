use crate::error::AppError;
use crate::stream::types::{DEDUP_STRIDE, RETENTION_CAPACITY};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

/// Working set of normalized records handed to consumers.
///
/// Length is capped at [`RETENTION_CAPACITY`]; a dedup pass runs whenever the
/// length lands on a multiple of [`DEDUP_STRIDE`] or overflows the cap.
#[derive(Debug, Clone)]
pub struct RetentionBuffer {
    records: VecDeque<Value>,
    capacity: usize,
    duplicates_removed: u64,
}

impl Default for RetentionBuffer {
    fn default() -> Self {
        Self::with_capacity(RETENTION_CAPACITY)
    }
}

impl RetentionBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.saturating_add(1)),
            capacity,
            duplicates_removed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates_removed(&self) -> u64 {
        self.duplicates_removed
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.iter().cloned().collect()
    }

    /// Lists are flattened into their entries; objects and primitives are
    /// appended as they are. The size triggers are checked after each entry.
    pub fn append(&mut self, record: Value) {
        match record {
            Value::Array(entries) => {
                for entry in entries {
                    self.push_one(entry);
                }
            }
            other => self.push_one(other),
        }
    }

    fn push_one(&mut self, record: Value) {
        self.records.push_back(record);

        let len = self.records.len();
        if len % DEDUP_STRIDE == 0 || len > self.capacity {
            self.run_dedup();
        }

        if self.records.len() > self.capacity {
            let overflow = self.records.len() - self.capacity;
            self.records.drain(0..overflow);
        }
    }

    fn run_dedup(&mut self) {
        match dedup_records(&self.records) {
            Ok((deduped, removed)) => {
                self.records = deduped;
                self.duplicates_removed = self.duplicates_removed.saturating_add(removed as u64);
            }
            Err(error) => {
                warn!("dedup pass failed, keeping records unchanged: {error}");
            }
        }
    }
}

/// Structural key for a record: object keys are emitted sorted at every depth,
/// so two objects with the same fields in different orders encode identically.
fn record_key(record: &Value) -> Result<String, AppError> {
    let mut key = String::new();
    write_canonical(record, &mut key)?;
    Ok(key)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), AppError> {
    match value {
        Value::Object(object) => {
            let mut fields: Vec<(&String, &Value)> = object.iter().collect();
            fields.sort_unstable_by(|lhs, rhs| lhs.0.cmp(rhs.0));
            out.push('{');
            for (index, (name, field)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(name)?);
                out.push(':');
                write_canonical(field, out)?;
            }
            out.push('}');
        }
        Value::Array(entries) => {
            out.push('[');
            for (index, entry) in entries.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(entry, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Keeps the first occurrence of every structurally distinct record and
/// reports how many were dropped. Returns an error instead of a partial result.
pub fn dedup_records(records: &VecDeque<Value>) -> Result<(VecDeque<Value>, usize), AppError> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept = VecDeque::with_capacity(records.len());

    for record in records {
        if seen.insert(record_key(record)?) {
            kept.push_back(record.clone());
        }
    }

    let removed = records.len() - kept.len();
    Ok((kept, removed))
}
