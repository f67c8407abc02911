//! Storyboard construction
//!
//! Building is a normalization pass: every scene definition is converted to
//! a fixed-shape record before any node exists. Bare closures become
//! enter-only scenes, missing handlers are filled with a no-op that reports
//! success, nested builders are built recursively, and previously built
//! storyboards are reused as scenes unchanged. All validation happens here;
//! a tree that builds cannot fail structurally at runtime.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::BuildError;
use crate::flow::Flow;
use crate::node::{lifecycle, NodeCell, Storyboard};

/// Handler invoked against the node's context for one transition phase.
pub type SceneHandler<C, A> = Rc<dyn Fn(&mut C, &A) -> Flow>;

/// Named helper invoked against the node's context.
///
/// Helpers are plain calls; they never get asynchronous completion
/// semantics.
pub type HelperFn<C, A> = Rc<dyn Fn(&mut C, &A)>;

/// Scene names reserved for transition choreography.
const RESERVED: [&str; 2] = [lifecycle::ENTER, lifecycle::EXIT];

pub(crate) fn succeed<C, A>() -> SceneHandler<C, A> {
    Rc::new(|_, _| Flow::Done)
}

/// Enter/exit handler pair for a single scene.
///
/// Missing handlers default to a no-op that reports success.
pub struct Scene<C = (), A = ()> {
    pub(crate) enter: Option<SceneHandler<C, A>>,
    pub(crate) exit: Option<SceneHandler<C, A>>,
}

impl<C, A> Scene<C, A> {
    pub fn new() -> Self {
        Self {
            enter: None,
            exit: None,
        }
    }

    /// Handler run when the scene is entered.
    pub fn on_enter<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C, &A) -> R + 'static,
        R: Into<Flow>,
    {
        self.enter = Some(Rc::new(move |context, args| handler(context, args).into()));
        self
    }

    /// Handler run when the scene is exited.
    pub fn on_exit<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C, &A) -> R + 'static,
        R: Into<Flow>,
    {
        self.exit = Some(Rc::new(move |context, args| handler(context, args).into()));
        self
    }
}

impl<C, A> Default for Scene<C, A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything accepted as a scene definition by [`StoryboardBuilder::scene`].
pub enum SceneDef<C = (), A = ()> {
    /// Leaf scene with explicit handlers.
    Leaf(Scene<C, A>),
    /// Nested storyboard built during the parent's build.
    Nested(StoryboardBuilder<C, A>),
    /// A previously built storyboard reused as a scene.
    Built(Storyboard<C, A>),
}

impl<C, A> From<Scene<C, A>> for SceneDef<C, A> {
    fn from(scene: Scene<C, A>) -> Self {
        SceneDef::Leaf(scene)
    }
}

impl<C, A> From<StoryboardBuilder<C, A>> for SceneDef<C, A> {
    fn from(builder: StoryboardBuilder<C, A>) -> Self {
        SceneDef::Nested(builder)
    }
}

impl<C, A> From<Storyboard<C, A>> for SceneDef<C, A> {
    fn from(storyboard: Storyboard<C, A>) -> Self {
        SceneDef::Built(storyboard)
    }
}

/// Builder for a storyboard tree.
///
/// A builder with scenes produces a composite node and must name its
/// `initial` scene; a builder without scenes produces a leaf node driven by
/// its own `on_enter`/`on_exit` handlers.
pub struct StoryboardBuilder<C = (), A = ()> {
    context: Option<C>,
    initial: Option<String>,
    scenes: Vec<(String, SceneDef<C, A>)>,
    enter: Option<SceneHandler<C, A>>,
    exit: Option<SceneHandler<C, A>>,
    helpers: Vec<(String, HelperFn<C, A>)>,
}

impl<C: 'static, A: 'static> StoryboardBuilder<C, A> {
    pub fn new() -> Self {
        Self {
            context: None,
            initial: None,
            scenes: Vec::new(),
            enter: None,
            exit: None,
            helpers: Vec::new(),
        }
    }

    /// Install an explicit context.
    ///
    /// Descendants without their own explicit context inherit the nearest
    /// ancestor's; a root built without one falls back to `C::default()`.
    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    /// Name the scene entered by `start()` and by parents transitioning
    /// into this storyboard.
    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    /// Define a scene: a [`Scene`] handler pair, a nested builder, or a
    /// previously built [`Storyboard`].
    pub fn scene(mut self, name: impl Into<String>, def: impl Into<SceneDef<C, A>>) -> Self {
        self.scenes.push((name.into(), def.into()));
        self
    }

    /// Define a scene from a bare enter handler; its exit always succeeds.
    pub fn scene_fn<F, R>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut C, &A) -> R + 'static,
        R: Into<Flow>,
    {
        self.scene(name, Scene::new().on_enter(handler))
    }

    /// Enter handler for a leaf storyboard (one built without scenes).
    pub fn on_enter<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C, &A) -> R + 'static,
        R: Into<Flow>,
    {
        self.enter = Some(Rc::new(move |context, args| handler(context, args).into()));
        self
    }

    /// Exit handler for a leaf storyboard.
    pub fn on_exit<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C, &A) -> R + 'static,
        R: Into<Flow>,
    {
        self.exit = Some(Rc::new(move |context, args| handler(context, args).into()));
        self
    }

    /// Attach a named helper invocable through `Storyboard::invoke`.
    pub fn helper<F>(mut self, name: impl Into<String>, helper: F) -> Self
    where
        F: Fn(&mut C, &A) + 'static,
    {
        self.helpers.push((name.into(), Rc::new(helper)));
        self
    }

    /// Build the storyboard tree.
    pub fn build(self) -> Result<Storyboard<C, A>, BuildError>
    where
        C: Default,
    {
        let cell = self.build_node()?;
        cell.ensure_fallback_context(C::default);
        Ok(Storyboard::from_cell(cell))
    }

    pub(crate) fn build_node(self) -> Result<Rc<NodeCell<C, A>>, BuildError> {
        let StoryboardBuilder {
            context,
            initial,
            scenes,
            enter,
            exit,
            helpers,
        } = self;

        let mut helper_map: FxHashMap<String, HelperFn<C, A>> = FxHashMap::default();
        for (name, helper) in helpers {
            if helper_map.insert(name.clone(), helper).is_some() {
                return Err(BuildError::DuplicateHelper(name));
            }
        }

        let cell = if scenes.is_empty() {
            NodeCell::leaf(
                enter.unwrap_or_else(succeed),
                exit.unwrap_or_else(succeed),
                helper_map,
            )
        } else {
            if enter.is_some() || exit.is_some() {
                return Err(BuildError::HandlersOnComposite);
            }
            let initial = initial.ok_or(BuildError::MissingInitial)?;

            let mut seen = FxHashSet::default();
            for (name, _) in &scenes {
                if RESERVED.contains(&name.as_str()) {
                    return Err(BuildError::ReservedSceneName(name.clone()));
                }
                if !seen.insert(name.clone()) {
                    return Err(BuildError::DuplicateScene(name.clone()));
                }
            }
            if !seen.contains(&initial) {
                return Err(BuildError::UnknownInitial(initial));
            }

            let cell = NodeCell::composite(initial, helper_map);
            for (name, def) in scenes {
                let child = match def {
                    SceneDef::Leaf(scene) => NodeCell::leaf(
                        scene.enter.unwrap_or_else(succeed),
                        scene.exit.unwrap_or_else(succeed),
                        FxHashMap::default(),
                    ),
                    SceneDef::Nested(builder) => builder.build_node()?,
                    SceneDef::Built(storyboard) => storyboard.into_cell(),
                };
                NodeCell::attach(&cell, &name, child);
            }
            cell
        };

        if let Some(context) = context {
            cell.install_context(context, true);
        }
        Ok(cell)
    }
}

impl<C: 'static, A: 'static> Default for StoryboardBuilder<C, A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_scene() -> Scene<(), ()> {
        Scene::new().on_enter(|_: &mut (), _: &()| true)
    }

    #[test]
    fn test_composite_requires_initial() {
        let err = StoryboardBuilder::new()
            .scene("idle", leaf_scene())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingInitial);
    }

    #[test]
    fn test_initial_must_name_a_scene() {
        let err = StoryboardBuilder::new()
            .initial("launch")
            .scene("idle", leaf_scene())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::UnknownInitial("launch".to_string()));
    }

    #[test]
    fn test_reserved_scene_names_rejected() {
        let err = StoryboardBuilder::new()
            .initial("exit")
            .scene("exit", leaf_scene())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::ReservedSceneName("exit".to_string()));
    }

    #[test]
    fn test_duplicate_scene_rejected() {
        let err = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", leaf_scene())
            .scene("idle", leaf_scene())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateScene("idle".to_string()));
    }

    #[test]
    fn test_leaf_handlers_rejected_on_composite() {
        let err = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", leaf_scene())
            .on_enter(|_: &mut (), _: &()| true)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::HandlersOnComposite);
    }

    #[test]
    fn test_duplicate_helper_rejected() {
        let err = StoryboardBuilder::new()
            .helper("reset", |_: &mut (), _: &()| {})
            .helper("reset", |_: &mut (), _: &()| {})
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateHelper("reset".to_string()));
    }

    #[test]
    fn test_builder_without_scenes_is_a_leaf() {
        let board = StoryboardBuilder::new()
            .on_enter(|_: &mut (), _: &()| true)
            .build()
            .unwrap();
        assert!(board.scenes().is_empty());
    }

    #[test]
    fn test_scene_fn_normalizes_to_enter_only() {
        let board = StoryboardBuilder::new()
            .initial("idle")
            .scene_fn("idle", |_: &mut (), _: &()| true)
            .build()
            .unwrap();

        // Implicit exit succeeds, so a round trip through the scene works.
        board.start();
        assert!(board.is_currently("idle"));
        let outcome = board.transition_to("idle", ());
        assert_eq!(outcome.result(), Some(true));
    }
}
