//! One-shot transition completion handles

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Waiter = Box<dyn FnOnce(bool)>;

#[derive(Default)]
struct OutcomeState {
    settled: Option<bool>,
    waiters: Vec<Waiter>,
}

/// The eventual success or failure of a transition.
///
/// An `Outcome` settles exactly once. Continuations registered after
/// settlement run immediately; settle signals arriving after settlement are
/// discarded. Handles are cheap to clone and all clones observe the same
/// settlement. A fresh handle is created per transition request; settled
/// handles are never reused.
pub struct Outcome {
    state: Rc<RefCell<OutcomeState>>,
}

impl Clone for Outcome {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl Outcome {
    /// An unsettled outcome together with the handle that settles it.
    ///
    /// Handlers use this to declare themselves asynchronous: return the
    /// outcome wrapped in [`Flow::Pending`](crate::Flow::Pending), keep the
    /// [`Settle`] half, and finish it whenever the work completes.
    pub fn deferred() -> (Outcome, Settle) {
        let outcome = Outcome::open();
        let settle = Settle {
            state: Rc::clone(&outcome.state),
        };
        (outcome, settle)
    }

    /// An outcome that settled before anyone could observe it in flight.
    pub fn settled(success: bool) -> Outcome {
        Outcome {
            state: Rc::new(RefCell::new(OutcomeState {
                settled: Some(success),
                waiters: Vec::new(),
            })),
        }
    }

    /// An unsettled outcome the engine settles through [`Outcome::force`].
    pub(crate) fn open() -> Outcome {
        Outcome {
            state: Rc::new(RefCell::new(OutcomeState::default())),
        }
    }

    /// Whether the outcome has settled.
    pub fn is_settled(&self) -> bool {
        self.state.borrow().settled.is_some()
    }

    /// The settled value, or `None` while the transition is in flight.
    pub fn result(&self) -> Option<bool> {
        self.state.borrow().settled
    }

    /// Register a continuation for settlement.
    ///
    /// Runs immediately when the outcome has already settled.
    pub fn on_settle<F>(&self, continuation: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let already = {
            let mut state = self.state.borrow_mut();
            match state.settled {
                Some(success) => Some(success),
                None => {
                    state.waiters.push(Box::new(continuation));
                    return;
                }
            }
        };
        if let Some(success) = already {
            continuation(success);
        }
    }

    /// Register a continuation that only runs on success.
    pub fn on_success<F>(&self, continuation: F)
    where
        F: FnOnce() + 'static,
    {
        self.on_settle(move |success| {
            if success {
                continuation();
            }
        });
    }

    /// Register a continuation that only runs on failure.
    pub fn on_failure<F>(&self, continuation: F)
    where
        F: FnOnce() + 'static,
    {
        self.on_settle(move |success| {
            if !success {
                continuation();
            }
        });
    }

    /// Settle from engine code. Late signals are dropped.
    pub(crate) fn force(&self, success: bool) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            if state.settled.is_some() {
                return;
            }
            state.settled = Some(success);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(success);
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("settled", &self.result())
            .finish()
    }
}

/// The settling half of a deferred [`Outcome`].
///
/// Consumed on use, so a handler can complete its transition at most once.
pub struct Settle {
    state: Rc<RefCell<OutcomeState>>,
}

impl Settle {
    /// Settle with an explicit pass/fail value.
    pub fn finish(self, success: bool) {
        Outcome { state: self.state }.force(success);
    }

    /// Settle successfully.
    pub fn done(self) {
        self.finish(true);
    }

    /// Settle as failed.
    pub fn fail(self) {
        self.finish(false);
    }
}
