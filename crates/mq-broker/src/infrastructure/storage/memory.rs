//! Embedded in-process storage backend.
//!
//! All state lives behind one mutex. A transaction holds the lock for its
//! whole lifetime and edits the shared state in place, recording an undo
//! entry per change. Commit forgets the log; dropping an uncommitted
//! transaction replays it in reverse.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use mq_core::{ClientId, Context, FilterType, MessageId, OrderBy};

use crate::application::storage::{
    Client, NewMessage, Storage, StorageError, StoredMessage, Transaction,
};
use crate::infrastructure::storage::now_micros;

#[derive(Debug, Clone)]
struct MessageRow {
    sender: ClientId,
    receiver: Option<ClientId>,
    context: Context,
    priority: u8,
    created_at: i64,
    content: String,
    queues: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    next_client_id: ClientId,
    next_message_id: MessageId,
    last_created_at: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    clients: HashMap<ClientId, Client>,
    queues: BTreeMap<String, BTreeSet<MessageId>>,
    messages: HashMap<MessageId, MessageRow>,
    counters: Counters,
}

impl MemoryState {
    fn client_by_name(&self, username: &str) -> Option<&Client> {
        self.clients.values().find(|c| c.username == username)
    }

    fn username(&self, id: ClientId) -> Result<String, StorageError> {
        self.clients
            .get(&id)
            .map(|c| c.username.clone())
            .ok_or_else(|| StorageError::Backend(format!("message references unknown client {id}")))
    }
}

/// The inverse of one in-place change.
#[derive(Debug)]
enum Undo {
    ClientInserted(ClientId),
    ClientOnline { id: ClientId, previous: bool },
    QueueCreated(String),
    QueueDeleted(String),
    QueueMemberAdded { queue: String, id: MessageId },
    QueueMemberRemoved { queue: String, id: MessageId },
    MessageInserted(MessageId),
    MessageQueueRemoved { id: MessageId, queue: String },
    MessageRemoved(MessageId, MessageRow),
}

impl Undo {
    fn revert(self, state: &mut MemoryState) {
        match self {
            Undo::ClientInserted(id) => {
                state.clients.remove(&id);
            }
            Undo::ClientOnline { id, previous } => {
                if let Some(client) = state.clients.get_mut(&id) {
                    client.online = previous;
                }
            }
            Undo::QueueCreated(name) => {
                state.queues.remove(&name);
            }
            Undo::QueueDeleted(name) => {
                state.queues.insert(name, BTreeSet::new());
            }
            Undo::QueueMemberAdded { queue, id } => {
                if let Some(ids) = state.queues.get_mut(&queue) {
                    ids.remove(&id);
                }
            }
            Undo::QueueMemberRemoved { queue, id } => {
                if let Some(ids) = state.queues.get_mut(&queue) {
                    ids.insert(id);
                }
            }
            Undo::MessageInserted(id) => {
                state.messages.remove(&id);
            }
            Undo::MessageQueueRemoved { id, queue } => {
                if let Some(row) = state.messages.get_mut(&id) {
                    row.queues.insert(queue);
                }
            }
            Undo::MessageRemoved(id, row) => {
                state.messages.insert(id, row);
            }
        }
    }
}

/// Mutex-guarded, non-persistent [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))?;
        let counters = state.counters;
        Ok(Box::new(MemoryTransaction {
            state,
            counters,
            undo: Vec::new(),
            committed: false,
        }))
    }
}

struct MemoryTransaction<'a> {
    state: MutexGuard<'a, MemoryState>,
    /// Counter values at `begin`, restored on rollback.
    counters: Counters,
    undo: Vec<Undo>,
    committed: bool,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let MemoryTransaction {
            state,
            counters,
            undo,
            ..
        } = self;
        for entry in undo.drain(..).rev() {
            entry.revert(state);
        }
        state.counters = *counters;
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn find_client_by_username(&mut self, username: &str) -> Result<Option<Client>, StorageError> {
        Ok(self.state.client_by_name(username).cloned())
    }

    fn create_client(&mut self, username: &str, online: bool) -> Result<ClientId, StorageError> {
        if self.state.client_by_name(username).is_some() {
            return Err(StorageError::Backend(format!("username {username} is taken")));
        }
        self.state.counters.next_client_id += 1;
        let id = self.state.counters.next_client_id;
        self.undo.push(Undo::ClientInserted(id));
        self.state.clients.insert(
            id,
            Client {
                id,
                username: username.to_string(),
                online,
            },
        );
        Ok(id)
    }

    fn set_client_online(&mut self, id: ClientId, online: bool) -> Result<(), StorageError> {
        let client = self
            .state
            .clients
            .get_mut(&id)
            .ok_or_else(|| StorageError::ClientNotFound(id.to_string()))?;
        let previous = std::mem::replace(&mut client.online, online);
        self.undo.push(Undo::ClientOnline { id, previous });
        Ok(())
    }

    fn create_queue(&mut self, name: &str) -> Result<(), StorageError> {
        if self.state.queues.contains_key(name) {
            return Err(StorageError::QueueExists(name.to_string()));
        }
        self.state.queues.insert(name.to_string(), BTreeSet::new());
        self.undo.push(Undo::QueueCreated(name.to_string()));
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) -> Result<(), StorageError> {
        match self.state.queues.get(name) {
            None => Err(StorageError::QueueNotFound(name.to_string())),
            Some(ids) if !ids.is_empty() => Err(StorageError::QueueNotEmpty(name.to_string())),
            Some(_) => {
                self.state.queues.remove(name);
                self.undo.push(Undo::QueueDeleted(name.to_string()));
                Ok(())
            }
        }
    }

    fn create_message(&mut self, message: &NewMessage) -> Result<MessageId, StorageError> {
        let receiver = match &message.receiver {
            Some(name) => Some(
                self.state
                    .client_by_name(name)
                    .map(|c| c.id)
                    .ok_or_else(|| StorageError::ClientNotFound(name.clone()))?,
            ),
            None => None,
        };
        if let Some(missing) = message.queues.iter().find(|q| !self.state.queues.contains_key(*q)) {
            return Err(StorageError::QueueNotFound(missing.clone()));
        }

        let counters = &mut self.state.counters;
        let created_at = now_micros().max(counters.last_created_at + 1);
        counters.last_created_at = created_at;
        counters.next_message_id += 1;
        let id = counters.next_message_id;

        for queue in &message.queues {
            let added = self
                .state
                .queues
                .get_mut(queue)
                .map_or(false, |ids| ids.insert(id));
            if added {
                self.undo.push(Undo::QueueMemberAdded {
                    queue: queue.clone(),
                    id,
                });
            }
        }
        self.undo.push(Undo::MessageInserted(id));
        self.state.messages.insert(
            id,
            MessageRow {
                sender: message.sender,
                receiver,
                context: message.context,
                priority: message.priority.get(),
                created_at,
                content: message.content.clone(),
                queues: message.queues.iter().cloned().collect(),
            },
        );
        Ok(id)
    }

    fn retrieve_top_message(
        &mut self,
        receiver: ClientId,
        filter: FilterType,
        value: &str,
        order: OrderBy,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let state = &*self.state;
        let sender_id = match filter {
            FilterType::Sender => match state.client_by_name(value) {
                Some(client) => Some(client.id),
                None => return Ok(None),
            },
            FilterType::Queue => None,
        };

        let candidates = state.queues.iter().flat_map(|(queue, ids)| {
            ids.iter().filter_map(move |id| state.messages.get(id).map(|m| (queue, *id, m)))
        });
        let best = candidates
            .filter(|(queue, _, m)| match filter {
                FilterType::Queue => queue.as_str() == value,
                FilterType::Sender => Some(m.sender) == sender_id,
            })
            .filter(|(_, _, m)| m.receiver.map_or(true, |r| r == receiver))
            .max_by(|(qa, _, a), (qb, _, b)| {
                let (ka, kb) = match order {
                    OrderBy::Priority => ((a.priority as i64, a.created_at), (b.priority as i64, b.created_at)),
                    OrderBy::Timestamp => ((a.created_at, a.priority as i64), (b.created_at, b.priority as i64)),
                };
                ka.cmp(&kb).then_with(|| qb.cmp(qa))
            });

        let Some((queue, id, row)) = best else {
            return Ok(None);
        };
        Ok(Some(StoredMessage {
            id,
            sender: state.username(row.sender)?,
            receiver: row.receiver.map(|r| state.username(r)).transpose()?,
            queue: queue.clone(),
            context: row.context,
            priority: row.priority,
            created_at: row.created_at,
            content: row.content.clone(),
        }))
    }

    fn delete_message_from_queue(&mut self, id: MessageId, queue: &str) -> Result<(), StorageError> {
        let removed = self
            .state
            .queues
            .get_mut(queue)
            .map_or(false, |ids| ids.remove(&id));
        if removed {
            self.undo.push(Undo::QueueMemberRemoved {
                queue: queue.to_string(),
                id,
            });
        }
        let (detached, orphaned) = match self.state.messages.get_mut(&id) {
            Some(row) => (row.queues.remove(queue), row.queues.is_empty()),
            None => (false, false),
        };
        if detached {
            self.undo.push(Undo::MessageQueueRemoved {
                id,
                queue: queue.to_string(),
            });
        }
        if orphaned {
            if let Some(row) = self.state.messages.remove(&id) {
                self.undo.push(Undo::MessageRemoved(id, row));
            }
        }
        Ok(())
    }

    fn queues_with_pending_messages_for(&mut self, receiver: ClientId) -> Result<Vec<String>, StorageError> {
        Ok(self
            .state
            .queues
            .iter()
            .filter(|(_, ids)| {
                ids.iter().any(|id| {
                    self.state.messages.get(id).and_then(|m| m.receiver) == Some(receiver)
                })
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_core::Priority;
    use crate::infrastructure::storage::conformance;

    #[test]
    fn test_memory_store_conformance() {
        conformance::run_all(|| Box::new(MemoryStore::new()) as Box<dyn Storage>);
    }

    #[test]
    fn test_dropped_transaction_discards_changes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.create_queue("q").unwrap();
        }
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.delete_queue("q"), Err(StorageError::QueueNotFound("q".to_string())));
    }

    fn seeded() -> (MemoryStore, ClientId, ClientId) {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let alice = tx.create_client("alice", true).unwrap();
        let bob = tx.create_client("bob", false).unwrap();
        tx.create_queue("a").unwrap();
        tx.create_queue("b").unwrap();
        tx.create_message(&NewMessage {
            sender: alice,
            receiver: Some("bob".to_string()),
            queues: vec!["a".to_string(), "b".to_string()],
            context: Context::None,
            priority: Priority::new(5).unwrap(),
            content: "kept".to_string(),
        })
        .unwrap();
        tx.commit().unwrap();
        (store, alice, bob)
    }

    #[test]
    fn test_rollback_restores_every_kind_of_change() {
        // Arrange
        let (store, alice, bob) = seeded();
        let before = {
            let mut tx = store.begin().unwrap();
            tx.retrieve_top_message(bob, FilterType::Queue, "a", OrderBy::Priority)
                .unwrap()
                .unwrap()
        };

        // Act
        {
            let mut tx = store.begin().unwrap();
            tx.set_client_online(alice, false).unwrap();
            tx.create_client("carol", true).unwrap();
            tx.create_queue("c").unwrap();
            tx.delete_message_from_queue(before.id, "a").unwrap();
            tx.delete_message_from_queue(before.id, "b").unwrap();
            tx.delete_queue("a").unwrap();
            tx.create_message(&NewMessage {
                sender: bob,
                receiver: None,
                queues: vec!["b".to_string()],
                context: Context::None,
                priority: Priority::new(1).unwrap(),
                content: "discarded".to_string(),
            })
            .unwrap();
        }

        // Assert
        let mut tx = store.begin().unwrap();
        assert!(tx.find_client_by_username("alice").unwrap().unwrap().online);
        assert_eq!(tx.find_client_by_username("carol").unwrap(), None);
        assert_eq!(tx.delete_queue("c"), Err(StorageError::QueueNotFound("c".to_string())));
        for queue in ["a", "b"] {
            let top = tx
                .retrieve_top_message(bob, FilterType::Queue, queue, OrderBy::Priority)
                .unwrap();
            assert_eq!(top, Some(StoredMessage { queue: queue.to_string(), ..before.clone() }));
        }
        assert_eq!(tx.create_client("carol", true).unwrap(), bob + 1);
    }

    #[test]
    fn test_reads_leave_no_undo_entries() {
        let (store, _alice, bob) = seeded();
        let state = store.state.lock().unwrap();
        let mut tx = MemoryTransaction {
            counters: state.counters,
            state,
            undo: Vec::new(),
            committed: false,
        };

        tx.find_client_by_username("alice").unwrap();
        tx.queues_with_pending_messages_for(bob).unwrap();
        tx.retrieve_top_message(bob, FilterType::Sender, "alice", OrderBy::Timestamp)
            .unwrap();

        assert!(tx.undo.is_empty());
    }
}
