//! Document storage and write application
//!
//! Writes are applied as a batch against an overlay and only merged into
//! the map when every write in the batch succeeded, so a failed commit
//! leaves no trace.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use docctx_core::{Error, FieldChange, Fields, Precondition, Result, SetOptions, Update};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredDoc {
    pub data: Fields,
    /// Commit sequence number of the last write, never 0 for a stored doc
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// A pending mutation of one document
#[derive(Debug, Clone)]
pub(crate) enum Write {
    Create {
        path: String,
        data: Fields,
    },
    Set {
        path: String,
        data: Fields,
        options: SetOptions,
    },
    Update {
        path: String,
        updates: Vec<Update>,
        preconditions: Vec<Precondition>,
    },
    Delete {
        path: String,
        preconditions: Vec<Precondition>,
    },
}

impl Write {
    fn path(&self) -> &str {
        match self {
            Write::Create { path, .. }
            | Write::Set { path, .. }
            | Write::Update { path, .. }
            | Write::Delete { path, .. } => path,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    docs: BTreeMap<String, StoredDoc>,
    seq: u64,
}

impl Store {
    pub fn get(&self, path: &str) -> Option<&StoredDoc> {
        self.docs.get(path)
    }

    /// Version of `path`, 0 when it does not exist.
    pub fn version(&self, path: &str) -> u64 {
        self.docs.get(path).map_or(0, |doc| doc.version)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Documents stored directly under `collection`, in id order.
    pub fn children(&self, collection: &str) -> Vec<(&str, &StoredDoc)> {
        let prefix = format!("{collection}/");
        self.docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, doc)| {
                let id = &path[prefix.len()..];
                (!id.contains('/')).then_some((id, doc))
            })
            .collect()
    }

    /// Ids of every document under `collection`, including ones that only
    /// exist as the parent of a nested collection.
    pub fn child_ids(&self, collection: &str) -> BTreeSet<String> {
        let prefix = format!("{collection}/");
        self.docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| path[prefix.len()..].split('/').next())
            .map(str::to_owned)
            .collect()
    }

    /// Apply `writes` atomically, in order. Returns the commit time.
    pub fn commit(&mut self, writes: &[Write], now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let version = self.seq + 1;
        let mut overlay: BTreeMap<&str, Option<StoredDoc>> = BTreeMap::new();

        for write in writes {
            let current = match overlay.get(write.path()) {
                Some(staged) => staged.clone(),
                None => self.docs.get(write.path()).cloned(),
            };
            let next = apply(write, current, version, now)?;
            overlay.insert(write.path(), next);
        }

        for (path, doc) in overlay {
            match doc {
                Some(doc) => self.docs.insert(path.to_owned(), doc),
                None => self.docs.remove(path),
            };
        }
        self.seq = version;
        Ok(now)
    }
}

fn apply(
    write: &Write,
    current: Option<StoredDoc>,
    version: u64,
    now: DateTime<Utc>,
) -> Result<Option<StoredDoc>> {
    let stamp = |data: Fields, create_time: Option<DateTime<Utc>>| StoredDoc {
        data,
        version,
        create_time: create_time.unwrap_or(now),
        update_time: now,
    };

    match write {
        Write::Create { path, data } => {
            if current.is_some() {
                return Err(Error::already_exists(path.as_str()));
            }
            Ok(Some(stamp(data.clone(), None)))
        }
        Write::Set {
            data, options, ..
        } => {
            let created = current.as_ref().map(|doc| doc.create_time);
            let mut fields = current.map(|doc| doc.data).unwrap_or_default();
            match options {
                SetOptions::Overwrite => fields = data.clone(),
                SetOptions::MergeAll => merge(&mut fields, data),
                SetOptions::Merge(paths) => {
                    for path in paths {
                        let value = lookup(data, path).ok_or_else(|| {
                            Error::invalid_argument(format!(
                                "merge field '{path}' is not present in the data"
                            ))
                        })?;
                        set_field(&mut fields, path, value.clone())?;
                    }
                }
            }
            Ok(Some(stamp(fields, created)))
        }
        Write::Update {
            path,
            updates,
            preconditions,
        } => {
            check_preconditions(path, preconditions, current.as_ref())?;
            let Some(doc) = current else {
                return Err(Error::not_found(path.as_str()));
            };
            let mut fields = doc.data;
            for update in updates {
                match &update.change {
                    FieldChange::Set(value) => set_field(&mut fields, &update.field, value.clone())?,
                    FieldChange::Delete => delete_field(&mut fields, &update.field)?,
                }
            }
            Ok(Some(stamp(fields, Some(doc.create_time))))
        }
        Write::Delete {
            path,
            preconditions,
        } => {
            check_preconditions(path, preconditions, current.as_ref())?;
            Ok(None)
        }
    }
}

fn check_preconditions(
    path: &str,
    preconditions: &[Precondition],
    current: Option<&StoredDoc>,
) -> Result<()> {
    for precondition in preconditions {
        match (precondition, current) {
            (Precondition::Exists, None) => return Err(Error::not_found(path)),
            (Precondition::UpdateTime(_), None) => {
                return Err(Error::failed_precondition(format!(
                    "'{path}' does not exist"
                )))
            }
            (Precondition::UpdateTime(expected), Some(doc)) if doc.update_time != *expected => {
                return Err(Error::failed_precondition(format!(
                    "'{path}' was updated at {}, expected {expected}",
                    doc.update_time
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Split a dotted field path into its last segment and the segments
/// leading to it.
fn split_field(path: &str) -> Result<(&str, Vec<&str>)> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().filter(|last| !last.is_empty());
    match last {
        Some(last) if parts.iter().all(|p| !p.is_empty()) => Ok((last, parts)),
        _ => Err(Error::invalid_argument(format!(
            "invalid field path '{path}'"
        ))),
    }
}

fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = fields.get(parts.next()?)?;
    parts.try_fold(first, |value, part| value.as_object()?.get(part))
}

fn set_field(fields: &mut Fields, path: &str, value: Value) -> Result<()> {
    let (last, parents) = split_field(path)?;
    let mut map = fields;
    for part in parents {
        let slot = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return Err(Error::invalid_argument(format!("invalid field path '{path}'")));
        };
        map = next;
    }
    map.insert(last.to_string(), value);
    Ok(())
}

fn delete_field(fields: &mut Fields, path: &str) -> Result<()> {
    let (last, parents) = split_field(path)?;
    let mut map = fields;
    for part in parents {
        match map.get_mut(part).and_then(Value::as_object_mut) {
            Some(next) => map = next,
            None => return Ok(()),
        }
    }
    map.remove(last);
    Ok(())
}

/// Deep merge: maps merge key by key, everything else is replaced.
fn merge(target: &mut Fields, source: &Fields) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
