//! Priority-ordered publish/subscribe channels
//!
//! Every storyboard node owns an [`EventBus`]; the bus itself knows nothing
//! about storyboards and can carry any payload type. Dispatch is synchronous:
//! `publish` invokes every subscriber for an event, in priority order, before
//! it returns.
//!
//! - Subscribers are kept sorted by non-increasing priority; ties preserve
//!   insertion order.
//! - `subscribe` returns a [`Token`] usable for later removal. Callers may
//!   also supply their own token via [`SubscribeOptions`].
//! - `subscribe_once` removes its own registration before the callback runs,
//!   so the callback fires exactly once even if it re-publishes the event.
//! - Dispatch works on a snapshot of the subscriber list, so callbacks may
//!   freely subscribe, unsubscribe, or publish while an event is in flight.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies a single subscription on a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    /// Generate a fresh, process-unique token.
    pub fn next() -> Self {
        Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging or external bookkeeping.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct a token from a raw value.
    pub fn from_raw(raw: u64) -> Self {
        Token(raw)
    }
}

/// Options for [`EventBus::subscribe_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    /// Higher priorities fire first; equal priorities fire in insertion
    /// order. Defaults to 0.
    pub priority: i32,
    /// Caller-supplied token. A fresh one is generated when `None`.
    pub token: Option<Token>,
}

type Callback<P> = Rc<dyn Fn(&P)>;

struct Subscriber<P> {
    token: Token,
    priority: i32,
    callback: Callback<P>,
}

impl<P> Clone for Subscriber<P> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            priority: self.priority,
            callback: Rc::clone(&self.callback),
        }
    }
}

type Channel<P> = SmallVec<[Subscriber<P>; 4]>;

struct BusInner<P> {
    channels: FxHashMap<String, Channel<P>>,
}

impl<P> BusInner<P> {
    /// Insert keeping the channel sorted by non-increasing priority, new
    /// entries going after all entries of priority >= theirs.
    fn insert(&mut self, event: &str, subscriber: Subscriber<P>) {
        let channel = self.channels.entry(event.to_string()).or_default();
        let at = channel
            .iter()
            .position(|s| s.priority < subscriber.priority)
            .unwrap_or(channel.len());
        channel.insert(at, subscriber);
    }

    fn remove(&mut self, event: &str, token: Token) -> bool {
        let Some(channel) = self.channels.get_mut(event) else {
            return false;
        };
        let before = channel.len();
        channel.retain(|s| s.token != token);
        let removed = channel.len() != before;
        if channel.is_empty() {
            self.channels.remove(event);
        }
        removed
    }
}

/// A synchronous publish/subscribe channel map.
///
/// Cheap to clone; clones share the same subscriber state.
pub struct EventBus<P> {
    inner: Rc<RefCell<BusInner<P>>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventBus<P> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(BusInner {
                channels: FxHashMap::default(),
            })),
        }
    }
}

impl<P: 'static> EventBus<P> {
    /// Subscribe at the default priority.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Token
    where
        F: Fn(&P) + 'static,
    {
        self.subscribe_with(event, SubscribeOptions::default(), callback)
    }

    /// Subscribe with an explicit priority and/or caller-supplied token.
    pub fn subscribe_with<F>(&self, event: &str, options: SubscribeOptions, callback: F) -> Token
    where
        F: Fn(&P) + 'static,
    {
        let token = options.token.unwrap_or_else(Token::next);
        self.inner.borrow_mut().insert(
            event,
            Subscriber {
                token,
                priority: options.priority,
                callback: Rc::new(callback),
            },
        );
        token
    }

    /// Subscribe a callback that fires at most once.
    ///
    /// The registration is removed before the callback is invoked, so a
    /// callback that re-publishes the same event cannot retrigger itself.
    pub fn subscribe_once<F>(&self, event: &str, callback: F) -> Token
    where
        F: Fn(&P) + 'static,
    {
        let token = Token::next();
        let weak = Rc::downgrade(&self.inner);
        let name = event.to_string();
        self.subscribe_with(
            event,
            SubscribeOptions {
                priority: 0,
                token: Some(token),
            },
            move |payload: &P| {
                // A stale dispatch snapshot may still hold this entry after
                // removal; only the call that wins the removal fires.
                if !remove_from(&weak, &name, token) {
                    return;
                }
                callback(payload);
            },
        )
    }

    /// Remove the subscription identified by `token`. Returns whether a
    /// subscription was removed.
    pub fn unsubscribe(&self, event: &str, token: Token) -> bool {
        self.inner.borrow_mut().remove(event, token)
    }

    /// Remove every subscription for `event`, returning how many there were.
    pub fn unsubscribe_all(&self, event: &str) -> usize {
        self.inner
            .borrow_mut()
            .channels
            .remove(event)
            .map(|channel| channel.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .borrow()
            .channels
            .get(event)
            .map(|channel| channel.len())
            .unwrap_or(0)
    }

    /// Invoke every subscriber for `event`, in priority order.
    ///
    /// No subscribers is a no-op, not an error.
    pub fn publish(&self, event: &str, payload: &P) {
        let snapshot: Option<Channel<P>> = self.inner.borrow().channels.get(event).cloned();
        let Some(subscribers) = snapshot else {
            return;
        };
        trace!(event, count = subscribers.len(), "dispatch");
        for subscriber in &subscribers {
            (subscriber.callback)(payload);
        }
    }
}

fn remove_from<P>(bus: &Weak<RefCell<BusInner<P>>>, event: &str, token: Token) -> bool {
    match bus.upgrade() {
        Some(inner) => inner.borrow_mut().remove(event, token),
        None => false,
    }
}
