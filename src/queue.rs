//! Message queues shared across all connections of one role.
//!
//! One queue holds incoming payloads waiting for the application, the other
//! holds outgoing messages waiting for a connection's outgoing processor.
//! Every item has its own message id, independent of the connection it
//! belongs to, and is returned at most once after removal.
//!
//! Items are kept in insertion order, so `next_for` and `next_any` return
//! the oldest pending item.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// One pending item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem<T> {
    /// Unique id of this item.
    pub message_id: Uuid,
    /// Connection the item belongs to.
    pub connection_id: Uuid,
    /// The queued payload.
    pub payload: T,
}

#[derive(Debug)]
struct Inner<T> {
    items: HashMap<Uuid, QueuedItem<T>>,
    order: VecDeque<Uuid>,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

impl<T> Inner<T> {
    fn first_matching(&self, connection_id: Option<Uuid>) -> Option<Uuid> {
        self.order
            .iter()
            .copied()
            .find(|id| match (connection_id, self.items.get(id)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(conn), Some(item)) => item.connection_id == conn,
            })
    }

    fn take(&mut self, message_id: Uuid) -> Option<QueuedItem<T>> {
        let item = self.items.remove(&message_id)?;
        if let Some(pos) = self.order.iter().position(|id| *id == message_id) {
            self.order.remove(pos);
        }
        Some(item)
    }
}

/// Thread-safe keyed queue of [`QueuedItem`]s.
#[derive(Debug)]
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload for a connection and return its message id.
    pub fn add(&self, connection_id: Uuid, payload: T) -> Uuid {
        let message_id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.items.insert(
            message_id,
            QueuedItem {
                message_id,
                connection_id,
                payload,
            },
        );
        inner.order.push_back(message_id);
        message_id
    }

    /// Look up an item without removing it.
    pub fn get(&self, message_id: Uuid) -> Option<QueuedItem<T>> {
        self.lock().items.get(&message_id).cloned()
    }

    /// Remove an item. Returns `false` if it was not present.
    pub fn remove(&self, message_id: Uuid) -> bool {
        self.lock().take(message_id).is_some()
    }

    /// Oldest pending item for a connection, left in place.
    pub fn next_for(&self, connection_id: Uuid) -> Option<QueuedItem<T>> {
        let inner = self.lock();
        let id = inner.first_matching(Some(connection_id))?;
        inner.items.get(&id).cloned()
    }

    /// Oldest pending item of any connection, left in place.
    pub fn next_any(&self) -> Option<QueuedItem<T>> {
        let inner = self.lock();
        let id = inner.first_matching(None)?;
        inner.items.get(&id).cloned()
    }

    /// Remove and return the oldest pending item for a connection.
    ///
    /// Lookup and removal happen under one lock, so concurrent readers never
    /// receive the same item.
    pub fn take_next_for(&self, connection_id: Uuid) -> Option<QueuedItem<T>> {
        let mut inner = self.lock();
        let id = inner.first_matching(Some(connection_id))?;
        inner.take(id)
    }

    /// Remove and return the oldest pending item of any connection.
    pub fn take_next_any(&self) -> Option<QueuedItem<T>> {
        let mut inner = self.lock();
        let id = inner.first_matching(None)?;
        inner.take(id)
    }

    /// Drop every item belonging to a connection. Returns how many were dropped.
    pub fn purge(&self, connection_id: Uuid) -> usize {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(|_, item| item.connection_id != connection_id);
        let Inner { items, order } = &mut *inner;
        order.retain(|id| items.contains_key(id));
        before - items.len()
    }

    /// Number of items pending for a connection.
    pub fn pending_for(&self, connection_id: Uuid) -> usize {
        self.lock()
            .items
            .values()
            .filter(|item| item.connection_id == connection_id)
            .count()
    }

    /// Total number of pending items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_add_get_remove() {
        let queue = MessageQueue::new();
        let conn = Uuid::new_v4();
        let id = queue.add(conn, "payload".to_string());

        let item = queue.get(id).unwrap();
        assert_eq!(item.message_id, id);
        assert_eq!(item.connection_id, conn);
        assert_eq!(item.payload, "payload");

        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.get(id).is_none());
        assert!(queue.next_for(conn).is_none());
        assert!(queue.next_any().is_none());
    }

    #[test]
    fn test_next_for_filters_by_connection_in_insertion_order() {
        let queue = MessageQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.add(a, 1);
        queue.add(b, 2);
        queue.add(a, 3);

        assert_eq!(queue.next_for(b).unwrap().payload, 2);
        assert_eq!(queue.take_next_for(a).unwrap().payload, 1);
        assert_eq!(queue.take_next_for(a).unwrap().payload, 3);
        assert!(queue.take_next_for(a).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_next_any_returns_oldest_without_removing() {
        let queue = MessageQueue::new();
        let first = queue.add(Uuid::new_v4(), "first");
        queue.add(Uuid::new_v4(), "second");

        assert_eq!(queue.next_any().unwrap().message_id, first);
        assert_eq!(queue.next_any().unwrap().message_id, first);
        assert_eq!(queue.take_next_any().unwrap().payload, "first");
        assert_eq!(queue.take_next_any().unwrap().payload, "second");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purge_drops_only_that_connection() {
        let queue = MessageQueue::new();
        let gone = Uuid::new_v4();
        let kept = Uuid::new_v4();
        queue.add(gone, 'a');
        queue.add(kept, 'b');
        queue.add(gone, 'c');

        assert_eq!(queue.purge(gone), 2);
        assert_eq!(queue.pending_for(gone), 0);
        assert_eq!(queue.pending_for(kept), 1);
        assert_eq!(queue.take_next_any().unwrap().payload, 'b');
    }

    #[test]
    fn test_concurrent_takers_receive_each_item_once() {
        let queue = Arc::new(MessageQueue::new());
        let conn = Uuid::new_v4();
        for i in 0..1000 {
            queue.add(conn, i);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.take_next_for(conn) {
                        seen.push(item.payload);
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for value in handle.join().unwrap() {
                total += 1;
                all.insert(value);
            }
        }
        assert_eq!(total, 1000);
        assert_eq!(all.len(), 1000);
        assert!(queue.is_empty());
    }
}
