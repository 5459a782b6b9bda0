//! Indexed store backed by `sled`
//!
//! Layout:
//! - tree `entries`: `message:<id>` → JSON-encoded message
//! - tree `messages`: one key per known id (the global set)
//! - tree `sender:<sender>`: one key per id sent by `<sender>`
//!
//! Set trees store empty values; membership is the presence of the key.
//! Every mutation runs as one sled transaction across the trees involved,
//! so readers never observe an entry without its index keys or the reverse.
//!
//! Reads are not snapshots. `list` resolves ids first and fetches entries
//! afterwards, so an id deleted in between just leaves a hole that is
//! skipped.

use std::collections::HashSet;

use chrono::TimeDelta;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::model::Message;
use crate::utils::{Error, Result};

const MESSAGE_KEY_PREFIX: &str = "message:";
const MESSAGE_SET_TREE: &str = "messages";
const SENDER_INDEX_PREFIX: &str = "sender:";
const ENTRIES_TREE: &str = "entries";

/// Attempts before `save` or `delete` gives up racing a concurrent overwrite.
const MAX_TXN_ATTEMPTS: usize = 16;

/// Why a store transaction gave up without writing.
#[derive(Debug)]
enum Abort {
    /// The entry's sender changed between the read and the transaction.
    SenderMoved,
}

/// Result of [`IndexedStore::verify_indexes`]. Every list is empty for a
/// consistent store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub entries: usize,
    /// Entries whose id is missing from the global set.
    pub unindexed: Vec<String>,
    /// Ids in the global set without an entry.
    pub dangling: Vec<String>,
    /// `(sender, id)` pairs in a sender set that do not match an entry of
    /// that sender.
    pub misplaced: Vec<(String, String)>,
    /// Entries that do not decode.
    pub corrupt: Vec<String>,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.unindexed.is_empty()
            && self.dangling.is_empty()
            && self.misplaced.is_empty()
            && self.corrupt.is_empty()
    }
}

#[derive(Clone)]
pub struct IndexedStore {
    db: Db,
    entries: Tree,
    ids: Tree,
}

impl IndexedStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Self::with_db(sled::open(path)?)
    }

    /// A throwaway database removed when the last handle drops.
    pub fn temporary() -> Result<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self> {
        if settings.temporary {
            Self::temporary()
        } else {
            Self::open(&settings.path)
        }
    }

    fn with_db(db: Db) -> Result<Self> {
        let entries = db.open_tree(ENTRIES_TREE)?;
        let ids = db.open_tree(MESSAGE_SET_TREE)?;
        Ok(Self { db, entries, ids })
    }

    fn sender_tree(&self, sender: &str) -> Result<Tree> {
        Ok(self.db.open_tree(sender_key(sender))?)
    }

    /// Upserts `message` and its index keys in one transaction.
    ///
    /// When an existing entry with the same id belongs to another sender, the
    /// id moves to the new sender's set in that same transaction.
    pub fn save(&self, message: &Message) -> Result<Message> {
        let key = message_key(message.id());
        let value = serde_json::to_vec(message)?;
        let id = message.id().as_bytes();
        let sender_tree = self.sender_tree(message.sender())?;

        for _ in 0..MAX_TXN_ATTEMPTS {
            let previous = self.stored_sender(&key)?;
            let moved_from = previous.clone().filter(|p| p != message.sender());

            let outcome = match &moved_from {
                None => (&self.entries, &self.ids, &sender_tree).transaction(|(e, a, s)| {
                    expect_sender(e, &key, &previous)?;
                    e.insert(key.as_bytes(), value.as_slice())?;
                    a.insert(id, &[] as &[u8])?;
                    s.insert(id, &[] as &[u8])?;
                    Ok(())
                }),
                Some(old_sender) => {
                    let old_tree = self.sender_tree(old_sender)?;
                    (&self.entries, &self.ids, &sender_tree, &old_tree).transaction(
                        |(e, a, s, o)| {
                            expect_sender(e, &key, &previous)?;
                            e.insert(key.as_bytes(), value.as_slice())?;
                            a.insert(id, &[] as &[u8])?;
                            s.insert(id, &[] as &[u8])?;
                            o.remove(id)?;
                            Ok(())
                        },
                    )
                }
            };

            match outcome {
                Ok(()) => {
                    if let Some(old_sender) = moved_from {
                        info!(
                            id = message.id(),
                            from = %old_sender,
                            to = message.sender(),
                            "Moved message to a new sender index"
                        );
                    }
                    debug!(id = message.id(), sender = message.sender(), "Message saved");
                    return Ok(message.clone());
                }
                Err(TransactionError::Abort(Abort::SenderMoved)) => {
                    debug!(id = message.id(), "Concurrent overwrite during save, retrying");
                }
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "save of '{}' kept racing concurrent overwrites",
            message.id()
        )))
    }

    /// Looks a message up by id. Undecodable data is a [`Error::Corruption`].
    pub fn get(&self, id: &str) -> Result<Option<Message>> {
        let key = message_key(id);
        match self.entries.get(key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(|reason| Error::Corruption { key, reason }),
        }
    }

    /// Every stored message, in no particular order.
    pub fn list(&self) -> Result<Vec<Message>> {
        let ids = collect_ids(&self.ids)?;
        self.fetch_many(&ids)
    }

    pub fn list_by_sender(&self, sender: &str) -> Result<Vec<Message>> {
        let ids = collect_ids(&self.sender_tree(sender)?)?;
        self.fetch_many(&ids)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.ids.contains_key(id.as_bytes())?)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolves a batch of ids in one pass, skipping ids whose entry is gone
    /// or does not decode.
    fn fetch_many(&self, ids: &[String]) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let key = message_key(id);
            let Some(bytes) = self.entries.get(key.as_bytes())? else {
                debug!(id = %id, "Indexed id has no entry, skipping");
                continue;
            };
            match decode(&bytes) {
                Ok(message) => messages.push(message),
                Err(reason) => warn!(key = %key, %reason, "Failed to deserialize message, skipping"),
            }
        }
        Ok(messages)
    }

    /// Removes a message and its index keys. Returns false when nothing was
    /// stored under `id`.
    ///
    /// The sender read up front is checked again inside the transaction; if a
    /// concurrent save moved the id to another sender, the delete retries
    /// against the new one.
    ///
    /// If the entry no longer decodes its sender is unknown; the entry and
    /// the global id still go, and the sender set keeps a dangling id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let key = message_key(id);
        let raw = id.as_bytes();

        for _ in 0..MAX_TXN_ATTEMPTS {
            let sender = match self.get(id) {
                Ok(Some(message)) => Some(message.sender().to_string()),
                Ok(None) => {
                    if self.ids.contains_key(raw)? {
                        self.ids.remove(raw)?;
                        debug!(id, "Dropped dangling id from the global set");
                    }
                    return Ok(false);
                }
                Err(err @ Error::Corruption { .. }) => {
                    warn!(id, error = %err, "Deleting undecodable entry, sender index left as is");
                    None
                }
                Err(err) => return Err(err),
            };

            let outcome = match &sender {
                Some(name) => {
                    let sender_tree = self.sender_tree(name)?;
                    (&self.entries, &self.ids, &sender_tree).transaction(|(e, a, s)| {
                        expect_sender(e, &key, &sender)?;
                        let existed = e.remove(key.as_bytes())?.is_some();
                        a.remove(raw)?;
                        s.remove(raw)?;
                        Ok(existed)
                    })
                }
                None => (&self.entries, &self.ids).transaction(|(e, a)| {
                    expect_sender(e, &key, &None)?;
                    let existed = e.remove(key.as_bytes())?.is_some();
                    a.remove(raw)?;
                    Ok(existed)
                }),
            };

            match outcome {
                Ok(existed) => {
                    debug!(id, existed, "Message deleted");
                    return Ok(existed);
                }
                Err(TransactionError::Abort(Abort::SenderMoved)) => {
                    debug!(id, "Concurrent overwrite during delete, retrying");
                }
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "delete of '{id}' kept racing concurrent overwrites"
        )))
    }

    /// Deletes every message older than `max_age` and returns how many went.
    ///
    /// This is a full scan followed by one `delete` per victim, run on demand.
    /// A message removed concurrently by someone else is not counted.
    pub fn evict_older_than(&self, max_age: TimeDelta) -> Result<usize> {
        let mut evicted = 0;
        for message in self.list()? {
            if !message.is_older_than(max_age) {
                continue;
            }
            match self.delete(message.id()) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(id = message.id(), error = %e, "Failed to evict message"),
            }
        }
        info!(evicted, max_age_secs = max_age.num_seconds(), "Eviction finished");
        Ok(evicted)
    }

    /// Cross-checks entries against the global set and every sender set.
    pub fn verify_indexes(&self) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let mut senders_by_id = std::collections::HashMap::new();

        for item in self.entries.iter() {
            let (key, bytes) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let id = key.trim_start_matches(MESSAGE_KEY_PREFIX).to_string();
            report.entries += 1;
            match decode(&bytes) {
                Ok(message) => {
                    senders_by_id.insert(id.clone(), message.sender().to_string());
                }
                Err(_) => report.corrupt.push(id.clone()),
            }
            if !self.ids.contains_key(id.as_bytes())? {
                report.unindexed.push(id);
            }
        }

        let known: HashSet<String> = collect_ids(&self.ids)?.into_iter().collect();
        for id in &known {
            if !self.entries.contains_key(message_key(id).as_bytes())? {
                report.dangling.push(id.clone());
            }
        }

        for name in self.db.tree_names() {
            let name = String::from_utf8_lossy(&name).into_owned();
            let Some(sender) = name.strip_prefix(SENDER_INDEX_PREFIX) else {
                continue;
            };
            for id in collect_ids(&self.db.open_tree(&name)?)? {
                if senders_by_id.get(&id).map(String::as_str) != Some(sender) {
                    report.misplaced.push((sender.to_string(), id));
                }
            }
        }

        Ok(report)
    }

    /// Blocks until all pending writes reach disk.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }

    /// Writes raw bytes under an id's entry key and indexes it globally,
    /// bypassing encoding. Lets tests plant corrupt entries.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.entries.insert(message_key(id).as_bytes(), bytes)?;
        self.ids.insert(id.as_bytes(), &[] as &[u8])?;
        Ok(())
    }

    /// Sender recorded in the current entry for `key`; `None` when absent or
    /// undecodable.
    fn stored_sender(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(key.as_bytes())?
            .and_then(|bytes| decode(&bytes).ok())
            .map(|m| m.sender().to_string()))
    }
}

impl std::fmt::Debug for IndexedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedStore")
            .field("db", &"sled::Db")
            .field("messages", &self.ids.len())
            .finish()
    }
}

fn message_key(id: &str) -> String {
    format!("{MESSAGE_KEY_PREFIX}{id}")
}

fn sender_key(sender: &str) -> String {
    format!("{SENDER_INDEX_PREFIX}{sender}")
}

fn decode(bytes: &[u8]) -> std::result::Result<Message, String> {
    let message: Message = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    message.validate().map_err(|e| e.to_string())?;
    Ok(message)
}

fn collect_ids(tree: &Tree) -> Result<Vec<String>> {
    tree.iter()
        .keys()
        .map(|key| -> Result<String> { Ok(String::from_utf8_lossy(&key?).into_owned()) })
        .collect()
}

/// Aborts the transaction when the entry's sender is no longer `expected`.
fn expect_sender(
    entries: &TransactionalTree,
    key: &str,
    expected: &Option<String>,
) -> std::result::Result<(), ConflictableTransactionError<Abort>> {
    let current = entries
        .get(key.as_bytes())?
        .and_then(|bytes| decode(&bytes).ok())
        .map(|m| m.sender().to_string());
    if &current != expected {
        return Err(ConflictableTransactionError::Abort(Abort::SenderMoved));
    }
    Ok(())
}
