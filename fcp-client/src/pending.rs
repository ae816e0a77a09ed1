//! Registries of outstanding waiters.
//!
//! Waiters are kept in two registries: one keyed by message name, one keyed by
//! correlation id. Each inbound message is offered to the oldest live waiter
//! under its name and, independently, to the oldest live waiter under its
//! `Identifier`. Messages nobody waits for are dropped.

use fcp_protocol::Message;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Outcome of offering a message to a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The waiter took the message and is finished.
    Resolved,
    /// The waiter took the message and stays registered, at the head of its
    /// queue, for the next one.
    Rearm,
    /// Nobody listens on the other end any more; offer the message to the
    /// next waiter.
    Gone,
}

/// A registered waiter. Runs synchronously inside [`PendingTable::dispatch`].
pub type Continuation = Box<dyn FnMut(&Message) -> Delivery + Send>;

/// Handle identifying one registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Which registries a dispatched message reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub by_name: bool,
    pub by_id: bool,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<String, VecDeque<(WaiterId, Continuation)>>,
}

impl Registry {
    fn push(&mut self, key: String, id: WaiterId, continuation: Continuation) {
        self.waiters
            .entry(key)
            .or_default()
            .push_back((id, continuation));
    }

    fn deliver(&mut self, key: &str, message: &Message) -> bool {
        let Some(queue) = self.waiters.get_mut(key) else {
            return false;
        };

        let mut delivered = false;
        while let Some((id, mut continuation)) = queue.pop_front() {
            match continuation(message) {
                Delivery::Resolved => {
                    delivered = true;
                    break;
                }
                Delivery::Rearm => {
                    queue.push_front((id, continuation));
                    delivered = true;
                    break;
                }
                Delivery::Gone => continue,
            }
        }

        if queue.is_empty() {
            self.waiters.remove(key);
        }
        delivered
    }

    fn remove_key(&mut self, key: &str) -> usize {
        self.waiters.remove(key).map_or(0, |queue| queue.len())
    }

    fn remove_waiter(&mut self, key: &str, id: WaiterId) -> bool {
        let Some(queue) = self.waiters.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|(waiter, _)| *waiter != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.waiters.remove(key);
        }
        removed
    }

    fn contains(&self, key: &str) -> bool {
        self.waiters.contains_key(key)
    }

    fn len(&self) -> usize {
        self.waiters.values().map(VecDeque::len).sum()
    }

    fn clear(&mut self) -> usize {
        let count = self.len();
        self.waiters.clear();
        count
    }
}

/// Wraps a oneshot sender as a single-resolution waiter.
fn once(tx: oneshot::Sender<Message>) -> Continuation {
    let mut tx = Some(tx);
    Box::new(move |message| match tx.take() {
        Some(tx) => match tx.send(message.clone()) {
            Ok(()) => Delivery::Resolved,
            Err(_) => Delivery::Gone,
        },
        None => Delivery::Gone,
    })
}

/// Outstanding waiters of one connection.
#[derive(Default)]
pub struct PendingTable {
    by_name: Registry,
    by_id: Registry,
    next_waiter: u64,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver for the next message named `name`.
    pub fn await_name(&mut self, name: impl Into<String>) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.register_name(name, once(tx));
        rx
    }

    /// Returns a receiver for the next message carrying correlation id `id`.
    pub fn await_id(&mut self, id: impl Into<String>) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.register_id(id, once(tx));
        rx
    }

    /// Registers a continuation under a message name.
    ///
    /// After [`close`](Self::close) the continuation is dropped immediately,
    /// which its receiving side observes as a closed connection.
    pub fn register_name(
        &mut self,
        name: impl Into<String>,
        continuation: Continuation,
    ) -> WaiterId {
        let id = self.allocate();
        if !self.closed {
            self.by_name.push(name.into(), id, continuation);
        }
        id
    }

    /// Registers a continuation under a correlation id.
    pub fn register_id(&mut self, key: impl Into<String>, continuation: Continuation) -> WaiterId {
        let id = self.allocate();
        if !self.closed {
            self.by_id.push(key.into(), id, continuation);
        }
        id
    }

    fn allocate(&mut self) -> WaiterId {
        let id = WaiterId(self.next_waiter);
        self.next_waiter += 1;
        id
    }

    /// Routes an inbound message to its waiters.
    pub fn dispatch(&mut self, message: &Message) -> Dispatched {
        let by_name = self.by_name.deliver(message.name(), message);
        let by_id = match message.identifier() {
            Some(id) => self.by_id.deliver(id, message),
            None => false,
        };
        Dispatched { by_name, by_id }
    }

    /// Removes every waiter registered under correlation id `id`.
    pub fn remove_id(&mut self, id: &str) -> bool {
        self.by_id.remove_key(id) > 0
    }

    /// Removes one waiter registered under message name `name`.
    pub fn remove_name_waiter(&mut self, name: &str, waiter: WaiterId) -> bool {
        self.by_name.remove_waiter(name, waiter)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.by_id.contains(id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains(name)
    }

    /// Drops every waiter and refuses new ones until [`reopen`](Self::reopen).
    ///
    /// Returns the number of waiters dropped.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.by_name.clear() + self.by_id.clear()
    }

    /// Accepts registrations again after a reconnect.
    pub fn reopen(&mut self) {
        self.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the number of registered waiters.
    pub fn len(&self) -> usize {
        self.by_name.len() + self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
