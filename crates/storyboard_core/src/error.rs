//! Construction-time validation errors

use thiserror::Error;

/// Problems detected while building a storyboard tree.
///
/// Everything here is caught before any node exists; runtime misuse of a
/// built tree (an unknown transition target) is a programming error and
/// panics instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A storyboard with scenes did not declare which one to enter first.
    #[error("storyboard with scenes requires an initial scene")]
    MissingInitial,

    /// `initial` names a scene that was never defined.
    #[error("initial scene `{0}` is not a defined scene")]
    UnknownInitial(String),

    /// `enter` and `exit` are reserved for transition choreography.
    #[error("scene name `{0}` is reserved")]
    ReservedSceneName(String),

    /// Two scenes were registered under the same name.
    #[error("scene `{0}` is defined twice")]
    DuplicateScene(String),

    /// A storyboard with scenes cannot also carry leaf enter/exit handlers.
    #[error("a storyboard with scenes cannot have its own enter/exit handlers")]
    HandlersOnComposite,

    /// Two helpers were registered under the same name.
    #[error("helper `{0}` is defined twice")]
    DuplicateHelper(String),
}
