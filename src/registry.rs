//! Packet handler registry
//!
//! Routes connection IDs and stateless reset tokens to the connection that
//! owns them. Entries are `Weak` so the registry never keeps a connection
//! alive on its own, and every operation is synchronous: the socket read
//! loop must never wait on a slow connection.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection_id::{ConnectionId, StatelessResetKey, StatelessResetToken};
use crate::error::{ConnectionError, TransportErrorCode};
use crate::packet::ReceivedPacket;

/// What the registry can do with a connection, without knowing its type
pub trait PacketHandler: Send + Sync {
    /// Queue a datagram for processing. Must not block.
    fn handle_packet(&self, packet: ReceivedPacket);

    /// Tear the connection down with `error` as its final error. Idempotent.
    fn destroy(&self, error: ConnectionError);

    /// Send CONNECTION_CLOSE with `code` and start draining
    fn close_with_transport_error(&self, code: TransportErrorCode);
}

/// The part of the registry a connection uses to manage its own routing entries
pub trait ConnectionRunner: Send + Sync {
    /// Register the first ID of a new connection. Fails if the ID is already bound.
    fn add(&self, id: &ConnectionId, handler: &Arc<dyn PacketHandler>) -> bool;

    /// Bind `new` to the handler owning `existing`.
    ///
    /// `existing` is bound alongside if it is not routed yet. Fails without
    /// mutation if either ID belongs to a different live handler.
    fn add_with_conn_id(
        &self,
        existing: &ConnectionId,
        new: &ConnectionId,
        handler: &Arc<dyn PacketHandler>,
    ) -> bool;

    /// Unbind an ID immediately
    fn remove(&self, id: &ConnectionId);

    /// Unbind an ID after the retirement delay
    fn retire(&self, id: &ConnectionId);

    /// Release every ID a destroyed connection still owns, including any
    /// waiting for retirement. The IDs stay refused for the retirement delay.
    fn remove_closed(&self, ids: &[ConnectionId], handler: &Weak<dyn PacketHandler>);

    /// Register a peer-issued stateless reset token
    fn add_reset_token(&self, token: StatelessResetToken, handler: &Arc<dyn PacketHandler>) -> bool;

    fn remove_reset_token(&self, token: &StatelessResetToken);

    /// Token the local side publishes for one of its own IDs
    fn stateless_reset_token(&self, id: &ConnectionId) -> StatelessResetToken;
}

type HandlerRef = Weak<dyn PacketHandler>;

fn is_same(entry: &HandlerRef, handler: &Arc<dyn PacketHandler>) -> bool {
    std::ptr::addr_eq(entry.as_ptr(), Arc::as_ptr(handler))
}

fn is_same_ref(entry: &HandlerRef, handler: &HandlerRef) -> bool {
    std::ptr::addr_eq(entry.as_ptr(), handler.as_ptr())
}

fn is_live(entry: &HandlerRef) -> bool {
    entry.strong_count() > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insert {
    Added,
    AlreadyOwned,
    Collision,
}

struct RetiredEntry {
    deadline: Instant,
    id: ConnectionId,
    handler: HandlerRef,
}

/// Routing table shared by an endpoint and all of its connections
pub struct PacketHandlerMap {
    handlers: DashMap<ConnectionId, HandlerRef>,
    reset_tokens: DashMap<StatelessResetToken, HandlerRef>,
    /// Ordered by deadline since the delay is fixed
    retired: Mutex<VecDeque<RetiredEntry>>,
    /// IDs of destroyed connections, refused until their deadline
    closed_ids: DashMap<ConnectionId, Instant>,
    reset_key: StatelessResetKey,
    retire_delay: Duration,
    closed: AtomicBool,
}

impl PacketHandlerMap {
    pub fn new(reset_key: StatelessResetKey, retire_delay: Duration) -> Self {
        Self {
            handlers: DashMap::new(),
            reset_tokens: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
            closed_ids: DashMap::new(),
            reset_key,
            retire_delay,
            closed: AtomicBool::new(false),
        }
    }

    /// Handler owning `id`, if any
    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<dyn PacketHandler>> {
        if self.is_closed() {
            return None;
        }
        self.handlers.get(id)?.upgrade()
    }

    /// Whether `id` belonged to a connection destroyed within the retirement delay
    pub fn is_recently_closed(&self, id: &ConnectionId) -> bool {
        self.closed_ids
            .get(id)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Handler that registered `token` as its peer's reset token
    pub fn lookup_by_reset_token(&self, token: &StatelessResetToken) -> Option<Arc<dyn PacketHandler>> {
        if self.is_closed() {
            return None;
        }
        self.reset_tokens.get(token)?.upgrade()
    }

    /// Destroy every registered connection with `error` and refuse all
    /// further registrations. Only the first call has any effect.
    pub fn close_all(&self, error: ConnectionError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut seen = HashSet::new();
        let mut handlers = Vec::new();
        let entries = self
            .handlers
            .iter()
            .map(|entry| entry.value().clone())
            .chain(self.reset_tokens.iter().map(|entry| entry.value().clone()))
            .collect::<Vec<_>>();
        for entry in entries {
            if let Some(handler) = entry.upgrade() {
                if seen.insert(Arc::as_ptr(&handler) as *const ()) {
                    handlers.push(handler);
                }
            }
        }

        self.handlers.clear();
        self.reset_tokens.clear();
        self.retired.lock().clear();
        self.closed_ids.clear();

        info!("Closing {} connections: {}", handlers.len(), error);

        // No map guard is held here, handlers may call back into the registry
        for handler in handlers {
            handler.destroy(error.clone());
        }
    }

    /// Remove retired IDs whose delay has passed and forget expired
    /// closed-connection IDs. Returns how many routes were removed.
    pub fn sweep_retired(&self, now: Instant) -> usize {
        self.closed_ids.retain(|_, deadline| *deadline > now);

        let due = {
            let mut retired = self.retired.lock();
            let mut due = Vec::new();
            while retired.front().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = retired.pop_front() {
                    due.push(entry);
                }
            }
            due
        };

        let mut removed = 0;
        for entry in due {
            // The ID may have been removed and rebound meanwhile
            let same = |_: &ConnectionId, current: &HandlerRef| is_same_ref(current, &entry.handler);
            if self.handlers.remove_if(&entry.id, same).is_some() {
                trace!("Removed retired connection ID {}", entry.id);
                removed += 1;
            }
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of routed connection IDs
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn reset_token_count(&self) -> usize {
        self.reset_tokens.len()
    }

    /// IDs waiting for the retirement sweep
    pub fn pending_retirements(&self) -> usize {
        self.retired.lock().len()
    }

    /// IDs of destroyed connections still being refused
    pub fn closed_id_count(&self) -> usize {
        self.closed_ids.len()
    }

    fn insert_id(&self, id: &ConnectionId, handler: &Arc<dyn PacketHandler>) -> Insert {
        match self.handlers.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if is_same(entry.get(), handler) && is_live(entry.get()) {
                    Insert::AlreadyOwned
                } else if is_live(entry.get()) {
                    Insert::Collision
                } else {
                    // Stale entry of a dropped connection
                    entry.insert(Arc::downgrade(handler));
                    Insert::Added
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(handler));
                Insert::Added
            }
        }
    }

    fn owned_elsewhere(&self, id: &ConnectionId, handler: &Arc<dyn PacketHandler>) -> bool {
        self.handlers
            .get(id)
            .is_some_and(|entry| is_live(entry.value()) && !is_same(entry.value(), handler))
    }

    fn remove_if_owned(&self, id: &ConnectionId, handler: &Arc<dyn PacketHandler>) {
        self.handlers.remove_if(id, |_, current| is_same(current, handler));
    }
}

impl ConnectionRunner for PacketHandlerMap {
    fn add(&self, id: &ConnectionId, handler: &Arc<dyn PacketHandler>) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.insert_id(id, handler) != Insert::Added {
            debug!("Connection ID {} is already in use", id);
            return false;
        }

        // close_all may have swept the tables between the check and the insert
        if self.is_closed() {
            self.remove_if_owned(id, handler);
            return false;
        }

        debug!("Added connection ID {}", id);
        true
    }

    fn add_with_conn_id(
        &self,
        existing: &ConnectionId,
        new: &ConnectionId,
        handler: &Arc<dyn PacketHandler>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }

        // Refuse before touching either entry so readers never see a binding
        // that is rolled back
        for id in [new, existing] {
            if self.owned_elsewhere(id, handler) {
                warn!("Refusing to bind connection ID {}: {} is owned by another connection", new, id);
                return false;
            }
        }

        let inserted_new = match self.insert_id(new, handler) {
            Insert::Added => true,
            Insert::AlreadyOwned => false,
            Insert::Collision => {
                warn!("Refusing to bind connection ID {}: owned by another connection", new);
                return false;
            }
        };

        let mut inserted_existing = false;
        if existing != new {
            match self.insert_id(existing, handler) {
                Insert::Added => inserted_existing = true,
                Insert::AlreadyOwned => {}
                Insert::Collision => {
                    warn!(
                        "Refusing to bind connection ID {}: {} is owned by another connection",
                        new, existing
                    );
                    if inserted_new {
                        self.remove_if_owned(new, handler);
                    }
                    return false;
                }
            }
        }

        if self.is_closed() {
            if inserted_new {
                self.remove_if_owned(new, handler);
            }
            if inserted_existing {
                self.remove_if_owned(existing, handler);
            }
            return false;
        }

        debug!("Bound connection ID {} alongside {}", new, existing);
        true
    }

    fn remove(&self, id: &ConnectionId) {
        if self.handlers.remove(id).is_some() {
            debug!("Removed connection ID {}", id);
        }
    }

    fn retire(&self, id: &ConnectionId) {
        let Some(handler) = self.handlers.get(id).map(|entry| entry.value().clone()) else {
            return;
        };

        if self.retire_delay.is_zero() {
            if self.handlers.remove_if(id, |_, current| is_same_ref(current, &handler)).is_some() {
                debug!("Removed connection ID {}", id);
            }
            return;
        }

        debug!("Retiring connection ID {} in {:?}", id, self.retire_delay);
        self.retired.lock().push_back(RetiredEntry {
            deadline: Instant::now() + self.retire_delay,
            id: id.clone(),
            handler,
        });
    }

    fn remove_closed(&self, ids: &[ConnectionId], handler: &Weak<dyn PacketHandler>) {
        let retiring = {
            let mut retired = self.retired.lock();
            let mut retiring = Vec::new();
            retired.retain(|entry| {
                if is_same_ref(&entry.handler, handler) {
                    retiring.push(entry.id.clone());
                    false
                } else {
                    true
                }
            });
            retiring
        };

        let deadline = Instant::now() + self.retire_delay;
        for id in ids.iter().chain(&retiring) {
            let removed = self
                .handlers
                .remove_if(id, |_, current| is_same_ref(current, handler))
                .is_some();
            if removed {
                debug!("Removed connection ID {} of closed connection", id);
            }
            // An ID rebound to another connection is not ours to refuse
            let released = removed || !self.handlers.contains_key(id);
            if released && !self.retire_delay.is_zero() && !self.is_closed() {
                self.closed_ids.insert(id.clone(), deadline);
            }
        }
    }

    fn add_reset_token(&self, token: StatelessResetToken, handler: &Arc<dyn PacketHandler>) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.reset_tokens.entry(token) {
            Entry::Occupied(mut entry) => {
                if is_live(entry.get()) {
                    if is_same(entry.get(), handler) {
                        return true;
                    }
                    warn!("Stateless reset token {:?} already belongs to another connection, possible abuse", token);
                    return false;
                }
                entry.insert(Arc::downgrade(handler));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(handler));
            }
        }

        if self.is_closed() {
            self.reset_tokens.remove_if(&token, |_, current| is_same(current, handler));
            return false;
        }
        true
    }

    fn remove_reset_token(&self, token: &StatelessResetToken) {
        self.reset_tokens.remove(token);
    }

    fn stateless_reset_token(&self, id: &ConnectionId) -> StatelessResetToken {
        self.reset_key.token_for(id)
    }
}

impl std::fmt::Debug for PacketHandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHandlerMap")
            .field("connection_ids", &self.handlers.len())
            .field("reset_tokens", &self.reset_tokens.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
