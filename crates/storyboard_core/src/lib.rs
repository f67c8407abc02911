//! Storyboard Core
//!
//! A hierarchical, asynchronous state machine. States ("scenes") may
//! themselves be storyboards; every scene exposes enter/exit handlers that
//! finish either during their own invocation or later, through a deferred
//! [`Outcome`]. Each node owns a priority-ordered event bus announcing
//! transition lifecycle events, with announcements bubbling to ancestors.
//!
//! # Example
//!
//! ```rust
//! use storyboard_core::{Scene, StoryboardBuilder};
//!
//! #[derive(Default)]
//! struct Player {
//!     playing: bool,
//! }
//!
//! let board = StoryboardBuilder::new()
//!     .initial("stopped")
//!     .scene(
//!         "stopped",
//!         Scene::new().on_exit(|p: &mut Player, _: &()| {
//!             p.playing = false;
//!             true
//!         }),
//!     )
//!     .scene(
//!         "playing",
//!         Scene::new().on_enter(|p: &mut Player, _: &()| {
//!             p.playing = true;
//!             true
//!         }),
//!     )
//!     .build()
//!     .unwrap();
//!
//! board.start();
//! let outcome = board.transition_to("playing", ());
//!
//! assert_eq!(outcome.result(), Some(true));
//! assert!(board.is_currently("playing"));
//! assert!(board.context().borrow().playing);
//! ```

pub mod builder;
pub mod error;
pub mod flow;
pub mod node;
pub mod outcome;

pub use builder::{HelperFn, Scene, SceneDef, SceneHandler, StoryboardBuilder};
pub use error::BuildError;
pub use flow::Flow;
pub use node::{lifecycle, NodeId, Notice, SharedContext, Storyboard, TransitionRecord};
pub use outcome::{Outcome, Settle};
pub use storyboard_bus::{EventBus, SubscribeOptions, Token};
