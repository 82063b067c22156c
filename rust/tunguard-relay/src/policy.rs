//! Per-flow admission: uid resolution and the allow decision.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::config::UidConfig;
use crate::session::FlowKey;

/// Decides whether a new flow may be relayed.
///
/// Consulted exactly once per flow, before any socket is opened. `uid` is
/// `None` when the owning application could not be identified.
pub trait PolicyGate: Send {
    fn is_allowed(&self, uid: Option<u32>, flow: &FlowKey) -> bool;
}

impl<F> PolicyGate for F
where
    F: Fn(Option<u32>, &FlowKey) -> bool + Send,
{
    fn is_allowed(&self, uid: Option<u32>, flow: &FlowKey) -> bool {
        self(uid, flow)
    }
}

/// Allow-list of application uids.
///
/// With filtering disabled every flow passes; otherwise only listed uids do,
/// and unknown uids are denied.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    filter: bool,
    uids: HashSet<u32>,
}

impl AllowList {
    pub fn new(filter: bool, uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            filter,
            uids: uids.into_iter().collect(),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(false, [])
    }
}

impl PolicyGate for AllowList {
    fn is_allowed(&self, uid: Option<u32>, _flow: &FlowKey) -> bool {
        if !self.filter {
            return true;
        }
        uid.is_some_and(|u| self.uids.contains(&u))
    }
}

/// Maps a flow to the uid of the application that owns its socket.
pub trait UidResolver: Send {
    fn resolve(&self, flow: &FlowKey) -> Option<u32>;
}

/// Resolver for hosts that cannot identify applications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUidResolver;

impl UidResolver for NoUidResolver {
    fn resolve(&self, _flow: &FlowKey) -> Option<u32> {
        None
    }
}

/// Bounded retry around a [`UidResolver`].
///
/// The kernel publishes a new socket's owner slightly after its first packet
/// reaches the tunnel, so the first lookup waits briefly and failures are
/// retried a fixed number of times. This blocks the loop thread for at most
/// [`max_wait`](Self::max_wait).
pub struct UidLookup {
    resolver: Box<dyn UidResolver>,
    first_delay: Duration,
    retry_delay: Duration,
    max_tries: u32,
}

impl UidLookup {
    pub fn new(resolver: Box<dyn UidResolver>, config: &UidConfig) -> Self {
        Self {
            resolver,
            first_delay: Duration::from_millis(config.first_delay_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_tries: config.max_tries.max(1),
        }
    }

    /// Lookup for hosts without a resolver: answers `None` at once.
    pub fn none() -> Self {
        Self {
            resolver: Box::new(NoUidResolver),
            first_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_tries: 1,
        }
    }

    /// Longest time one [`resolve`](Self::resolve) call can block.
    pub fn max_wait(&self) -> Duration {
        self.first_delay + self.retry_delay * (self.max_tries - 1)
    }

    pub fn resolve(&self, flow: &FlowKey) -> Option<u32> {
        if !self.first_delay.is_zero() {
            thread::sleep(self.first_delay);
        }
        for attempt in 1..=self.max_tries {
            if let Some(uid) = self.resolver.resolve(flow) {
                trace!("uid {} for {} after {} tries", uid, flow, attempt);
                return Some(uid);
            }
            if attempt < self.max_tries && !self.retry_delay.is_zero() {
                thread::sleep(self.retry_delay);
            }
        }
        trace!("uid unknown for {}", flow);
        None
    }
}
