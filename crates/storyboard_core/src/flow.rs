//! Handler results

use crate::outcome::Outcome;

/// What an enter/exit handler reports back to the transition engine.
///
/// Handlers that finish during their own invocation return [`Flow::Done`] or
/// [`Flow::Fail`]. A handler that needs to finish later creates a deferred
/// [`Outcome`], keeps the [`Settle`](crate::Settle) half, and returns the
/// outcome as [`Flow::Pending`]; the engine then waits for it to settle.
///
/// `bool` converts into `Flow` (`true` is `Done`, `false` is `Fail`), so
/// plain boolean-returning closures work as handlers.
#[derive(Debug)]
pub enum Flow {
    /// The phase succeeded; the transition may proceed.
    Done,
    /// The phase rejected the transition.
    Fail,
    /// The phase finishes later, when the outcome settles.
    Pending(Outcome),
}

impl From<bool> for Flow {
    fn from(success: bool) -> Self {
        if success {
            Flow::Done
        } else {
            Flow::Fail
        }
    }
}

impl From<Outcome> for Flow {
    fn from(outcome: Outcome) -> Self {
        Flow::Pending(outcome)
    }
}

impl From<()> for Flow {
    fn from(_: ()) -> Self {
        Flow::Done
    }
}
