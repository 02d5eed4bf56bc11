//! Notification gate.
//!
//! Importing a payload creates records that would normally notify their
//! watchers (new comments, new tasks, invitations). While an import is being
//! materialized those deliveries are pointless noise, so the state machine
//! closes the gate for the duration of `unserialize`.
//!
//! - [`NotificationGate`] is the suppressor port: a nesting depth counter per
//!   thread. A scope only silences deliveries made on the thread that entered
//!   it, so an import running on the executor never mutes other requests.
//! - [`GatedNotifier`] wraps an outbound [`Notifier`] and drops (and counts)
//!   deliveries attempted while its gate is closed for the calling thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use portage_auth::Login;
use portage_migration::NotificationSuppressor;

/// An outbound notification to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Login,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(recipient: impl Into<Login>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Delivery channel (mailer, push, webhook).
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: Notification);
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn deliver(&self, notification: Notification) {
        (**self).deliver(notification)
    }
}

/// Suppression switch with nesting, tracked per thread.
#[derive(Debug, Default)]
pub struct NotificationGate {
    depths: Mutex<HashMap<ThreadId, usize>>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Whether deliveries from the current thread go out.
    pub fn is_enabled(&self) -> bool {
        self.depth() == 0
    }

    /// Active suppression scopes on the current thread.
    pub fn depth(&self) -> usize {
        let current = thread::current().id();
        self.depths.lock().unwrap().get(&current).copied().unwrap_or(0)
    }

    /// Threads with at least one active scope.
    pub fn suppressing_threads(&self) -> usize {
        self.depths.lock().unwrap().len()
    }
}

impl NotificationSuppressor for NotificationGate {
    fn suppress(&self) {
        let current = thread::current().id();
        let mut depths = self.depths.lock().unwrap();
        let depth = depths.entry(current).or_insert(0);
        *depth += 1;
        debug!(depth = *depth, "notifications suppressed");
    }

    fn release(&self) {
        let current = thread::current().id();
        let mut depths = self.depths.lock().unwrap();
        match depths.get_mut(&current) {
            Some(depth) if *depth > 1 => {
                *depth -= 1;
                debug!(depth = *depth, "notification suppression released");
            }
            Some(_) => {
                depths.remove(&current);
                debug!(depth = 0, "notification suppression released");
            }
            None => warn!("notification suppression released more often than entered"),
        }
    }
}

/// A [`Notifier`] that only delivers while its gate is open.
pub struct GatedNotifier<N> {
    inner: N,
    gate: Arc<NotificationGate>,
    suppressed: AtomicU64,
}

impl<N: Notifier> GatedNotifier<N> {
    pub fn new(inner: N, gate: Arc<NotificationGate>) -> Self {
        Self {
            inner,
            gate,
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn gate(&self) -> &Arc<NotificationGate> {
        &self.gate
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    /// Deliveries dropped because the gate was closed.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl<N: Notifier> Notifier for GatedNotifier<N> {
    fn deliver(&self, notification: Notification) {
        if self.gate.is_enabled() {
            self.inner.deliver(notification);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(recipient = %notification.recipient, "notification dropped while suppressed");
        }
    }
}

impl<N> core::fmt::Debug for GatedNotifier<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GatedNotifier")
            .field("gate", &self.gate)
            .field("suppressed", &self.suppressed)
            .finish_non_exhaustive()
    }
}

/// Notifier that keeps deliveries in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    delivered: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Notifier for InMemoryNotifier {
    fn deliver(&self, notification: Notification) {
        self.delivered.lock().unwrap().push(notification);
    }
}

/// Notifier that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn deliver(&self, _notification: Notification) {}
}
