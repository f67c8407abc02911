//! Storyboard nodes and the transition engine
//!
//! A storyboard is a tree of nodes. Composite nodes own named child scenes
//! and choreograph transitions between them; leaf nodes run their own
//! enter/exit handlers. Transitions run exit-then-enter, may suspend while a
//! handler finishes asynchronously, and settle a one-shot [`Outcome`] either
//! way. Every node owns an [`EventBus`] announcing transition lifecycle
//! events; announcements bubble to ancestor buses so a root subscriber
//! observes transitions anywhere in the tree.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use storyboard_bus::{EventBus, SubscribeOptions, Token};

use crate::builder::{HelperFn, SceneHandler};
use crate::flow::Flow;
use crate::outcome::Outcome;

static NEXT_NODE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a storyboard node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        NodeId(NEXT_NODE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging or external bookkeeping.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Context cell shared between nodes and handed to handlers as `&mut C`.
pub type SharedContext<C> = Rc<RefCell<C>>;

/// Lifecycle event names published on a node's bus during transitions.
///
/// `exit` and `enter` also fire a scene-scoped companion shaped
/// `"<scene>:exit"` / `"<scene>:enter"`. `start`, `end`, and `fail` describe
/// the node's own transition rather than a particular scene and have no
/// scoped companion.
pub mod lifecycle {
    /// A transition attempt began.
    pub const START: &str = "start";
    /// The outgoing scene completed its exit phase.
    pub const EXIT: &str = "exit";
    /// The incoming scene completed its enter phase.
    pub const ENTER: &str = "enter";
    /// The transition completed successfully.
    pub const END: &str = "end";
    /// The transition failed in its exit or enter phase.
    pub const FAIL: &str = "fail";
}

fn scoped(scene: &str, event: &str) -> String {
    format!("{scene}:{event}")
}

/// Payload delivered to bus subscribers.
#[derive(Debug)]
pub struct Notice<A> {
    source: NodeId,
    scene: Option<String>,
    args: Rc<A>,
}

impl<A> Notice<A> {
    /// The node that originated the announcement (bubbled notices keep the
    /// original source).
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// The scene the event concerns, when one is meaningful.
    pub fn scene(&self) -> Option<&str> {
        self.scene.as_deref()
    }

    /// Arguments of the transition (or publish) that fired the event.
    pub fn args(&self) -> &A {
        &self.args
    }
}

impl<A> Clone for Notice<A> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            scene: self.scene.clone(),
            args: Rc::clone(&self.args),
        }
    }
}

/// One settled transition attempt on a composite node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    /// Scene that was active when the attempt began.
    pub from: Option<String>,
    /// Requested target scene.
    pub to: String,
    /// Whether the attempt completed successfully.
    pub succeeded: bool,
}

enum NodeKind<C, A> {
    Composite {
        children: RefCell<FxHashMap<String, Rc<NodeCell<C, A>>>>,
        initial: String,
        current: RefCell<Option<String>>,
        history: RefCell<SmallVec<[TransitionRecord; 8]>>,
    },
    Leaf {
        enter: SceneHandler<C, A>,
        exit: SceneHandler<C, A>,
        current: RefCell<Option<String>>,
    },
}

pub(crate) struct NodeCell<C, A> {
    id: NodeId,
    name: RefCell<Option<String>>,
    parent: RefCell<Weak<NodeCell<C, A>>>,
    context: RefCell<Option<SharedContext<C>>>,
    context_explicit: Cell<bool>,
    helpers: FxHashMap<String, HelperFn<C, A>>,
    bus: EventBus<Notice<A>>,
    transitioning: Cell<bool>,
    pending: RefCell<Option<Outcome>>,
    kind: NodeKind<C, A>,
}

impl<C, A> NodeCell<C, A> {
    fn base(kind: NodeKind<C, A>, helpers: FxHashMap<String, HelperFn<C, A>>) -> Rc<Self> {
        Rc::new(NodeCell {
            id: NodeId::next(),
            name: RefCell::new(None),
            parent: RefCell::new(Weak::new()),
            context: RefCell::new(None),
            context_explicit: Cell::new(false),
            helpers,
            bus: EventBus::new(),
            transitioning: Cell::new(false),
            pending: RefCell::new(None),
            kind,
        })
    }

    pub(crate) fn leaf(
        enter: SceneHandler<C, A>,
        exit: SceneHandler<C, A>,
        helpers: FxHashMap<String, HelperFn<C, A>>,
    ) -> Rc<Self> {
        Self::base(
            NodeKind::Leaf {
                enter,
                exit,
                current: RefCell::new(None),
            },
            helpers,
        )
    }

    pub(crate) fn composite(
        initial: String,
        helpers: FxHashMap<String, HelperFn<C, A>>,
    ) -> Rc<Self> {
        Self::base(
            NodeKind::Composite {
                children: RefCell::new(FxHashMap::default()),
                initial,
                current: RefCell::new(None),
                history: RefCell::new(SmallVec::new()),
            },
            helpers,
        )
    }

    /// Wire a child into a composite parent. Children are attached exactly
    /// once, during construction of the parent.
    pub(crate) fn attach(parent: &Rc<Self>, name: &str, child: Rc<Self>) {
        let NodeKind::Composite { children, .. } = &parent.kind else {
            unreachable!("attach target must be a composite node");
        };
        *child.name.borrow_mut() = Some(name.to_string());
        *child.parent.borrow_mut() = Rc::downgrade(parent);
        children.borrow_mut().insert(name.to_string(), child);
    }

    pub(crate) fn install_context(&self, context: C, explicit: bool) {
        *self.context.borrow_mut() = Some(Rc::new(RefCell::new(context)));
        self.context_explicit.set(explicit);
    }

    /// Give a root without an explicit context a default one. Stays
    /// non-explicit so that, if this root is later attached as a scene, the
    /// surrounding tree's context wins.
    pub(crate) fn ensure_fallback_context(&self, make: impl FnOnce() -> C) {
        let missing = self.context.borrow().is_none();
        if missing {
            *self.context.borrow_mut() = Some(Rc::new(RefCell::new(make())));
        }
    }

    fn current_name(&self) -> Option<String> {
        match &self.kind {
            NodeKind::Composite { current, .. } => current.borrow().clone(),
            NodeKind::Leaf { current, .. } => current.borrow().clone(),
        }
    }

    fn set_current(&self, value: Option<String>) {
        match &self.kind {
            NodeKind::Composite { current, .. } => *current.borrow_mut() = value,
            NodeKind::Leaf { current, .. } => *current.borrow_mut() = value,
        }
    }

    fn push_history(&self, from: Option<String>, to: String, succeeded: bool) {
        if let NodeKind::Composite { history, .. } = &self.kind {
            history.borrow_mut().push(TransitionRecord {
                from,
                to,
                succeeded,
            });
        }
    }

    /// The inner target used when a parent transitions into this node.
    fn entry_target(&self) -> &str {
        match &self.kind {
            NodeKind::Composite { initial, .. } => initial,
            NodeKind::Leaf { .. } => lifecycle::ENTER,
        }
    }

    /// Deep copy: fresh identity and mutable state everywhere, handler
    /// closures and context cells shared immutably.
    pub(crate) fn deep_clone(self: &Rc<Self>) -> Rc<Self> {
        let fresh = match &self.kind {
            NodeKind::Leaf { enter, exit, .. } => {
                NodeCell::leaf(Rc::clone(enter), Rc::clone(exit), self.helpers.clone())
            }
            NodeKind::Composite {
                children, initial, ..
            } => {
                let cell = NodeCell::composite(initial.clone(), self.helpers.clone());
                for (name, child) in children.borrow().iter() {
                    NodeCell::attach(&cell, name, child.deep_clone());
                }
                cell
            }
        };
        if let Some(context) = self.context.borrow().as_ref() {
            *fresh.context.borrow_mut() = Some(Rc::clone(context));
            fresh.context_explicit.set(self.context_explicit.get());
        }
        fresh
    }
}

impl<C: 'static, A: 'static> NodeCell<C, A> {
    /// Nearest explicit context up the tree, else the root's fallback.
    fn resolved_context(self: &Rc<Self>) -> SharedContext<C> {
        let mut node = Rc::clone(self);
        loop {
            if node.context_explicit.get() {
                if let Some(context) = node.context.borrow().as_ref() {
                    return Rc::clone(context);
                }
            }
            let parent = node.parent.borrow().upgrade();
            match parent {
                Some(parent) => node = parent,
                None => {
                    let context = node.context.borrow();
                    return Rc::clone(
                        context
                            .as_ref()
                            .expect("storyboard root always carries a context"),
                    );
                }
            }
        }
    }

    /// Publish on this node's bus, then bubble the same notice up the tree.
    fn announce(&self, event: &str, scene: Option<String>, args: &Rc<A>) {
        let notice = Notice {
            source: self.id,
            scene,
            args: Rc::clone(args),
        };
        self.bus.publish(event, &notice);
        let mut ancestor = self.parent.borrow().upgrade();
        while let Some(node) = ancestor {
            node.bus.publish(event, &notice);
            ancestor = node.parent.borrow().upgrade();
        }
    }

    pub(crate) fn request(self: &Rc<Self>, target: &str, args: Rc<A>) -> Outcome {
        match &self.kind {
            NodeKind::Leaf { .. } => self.leaf_transition(target, args),
            NodeKind::Composite { .. } if target == lifecycle::EXIT => self.cascade_exit(args),
            NodeKind::Composite { .. } => self.composite_transition(target, args),
        }
    }

    fn leaf_transition(self: &Rc<Self>, state: &str, args: Rc<A>) -> Outcome {
        let NodeKind::Leaf { enter, exit, .. } = &self.kind else {
            unreachable!("leaf transition on composite node");
        };
        let handler = match state {
            lifecycle::ENTER => Rc::clone(enter),
            lifecycle::EXIT => Rc::clone(exit),
            other => panic!("storyboard {} has no scene `{other}`", self.id),
        };

        if self.transitioning.get() {
            trace!(node = %self.id, state, "transition rejected: already in flight");
            return Outcome::settled(false);
        }
        self.transitioning.set(true);
        let outcome = Outcome::open();
        *self.pending.borrow_mut() = Some(outcome.clone());

        let context = self.resolved_context();
        let flow = {
            let mut context = context.borrow_mut();
            handler(&mut context, &args)
        };

        let state = state.to_string();
        match flow {
            Flow::Done => self.finish_leaf(&outcome, state, true),
            Flow::Fail => self.finish_leaf(&outcome, state, false),
            Flow::Pending(inner) => {
                let node = Rc::clone(self);
                let gate = outcome.clone();
                inner.on_settle(move |success| {
                    if gate.is_settled() {
                        return; // cancelled before the handler finished
                    }
                    node.finish_leaf(&gate, state, success);
                });
            }
        }
        outcome
    }

    fn finish_leaf(&self, gate: &Outcome, state: String, success: bool) {
        self.transitioning.set(false);
        *self.pending.borrow_mut() = None;
        if success {
            self.set_current(Some(state));
        }
        gate.force(success);
    }

    fn composite_transition(self: &Rc<Self>, target: &str, args: Rc<A>) -> Outcome {
        let NodeKind::Composite {
            children, current, ..
        } = &self.kind
        else {
            unreachable!("composite transition on leaf node");
        };

        // Unresolvable targets are a programming error, surfaced before any
        // state changes.
        let to = children
            .borrow()
            .get(target)
            .cloned()
            .unwrap_or_else(|| panic!("storyboard {} has no scene `{target}`", self.id));

        if self.transitioning.get() {
            trace!(node = %self.id, target, "transition rejected: already in flight");
            return Outcome::settled(false);
        }

        debug!(node = %self.id, target, "transition");
        let target = target.to_string();
        self.announce(lifecycle::START, Some(target.clone()), &args);
        self.transitioning.set(true);
        let outcome = Outcome::open();
        *self.pending.borrow_mut() = Some(outcome.clone());

        let from = current.borrow().clone();
        let exit_outcome = match &from {
            Some(name) => {
                let child = children
                    .borrow()
                    .get(name)
                    .cloned()
                    .expect("active scene is always a child");
                child.request(lifecycle::EXIT, Rc::clone(&args))
            }
            None => Outcome::settled(true),
        };

        let node = Rc::clone(self);
        let gate = outcome.clone();
        exit_outcome.on_settle(move |exit_ok| {
            if gate.is_settled() {
                return; // cancelled while the exit phase was in flight
            }
            if !exit_ok {
                node.fail_transition(&gate, from, target, &args);
                return;
            }
            if let Some(prev) = &from {
                node.announce(lifecycle::EXIT, Some(prev.clone()), &args);
                node.announce(&scoped(prev, lifecycle::EXIT), Some(prev.clone()), &args);
            }

            let enter_outcome = to.request(to.entry_target(), Rc::clone(&args));
            let node = Rc::clone(&node);
            let gate = gate.clone();
            enter_outcome.on_settle(move |enter_ok| {
                if gate.is_settled() {
                    return; // cancelled while the enter phase was in flight
                }
                if !enter_ok {
                    node.fail_transition(&gate, from, target, &args);
                    return;
                }
                node.announce(lifecycle::ENTER, Some(target.clone()), &args);
                node.announce(&scoped(&target, lifecycle::ENTER), Some(target.clone()), &args);
                node.transitioning.set(false);
                *node.pending.borrow_mut() = None;
                node.set_current(Some(target.clone()));
                node.push_history(from, target.clone(), true);
                node.announce(lifecycle::END, Some(target), &args);
                gate.force(true);
            });
        });

        outcome
    }

    fn fail_transition(&self, gate: &Outcome, from: Option<String>, target: String, args: &Rc<A>) {
        debug!(node = %self.id, %target, "transition failed");
        // `current` was never moved, so the active scene already holds its
        // pre-transition value.
        self.transitioning.set(false);
        *self.pending.borrow_mut() = None;
        self.push_history(from, target.clone(), false);
        self.announce(lifecycle::FAIL, Some(target), args);
        gate.force(false);
    }

    /// A parent transitioning away from this composite requests `"exit"`:
    /// run the active child's exit (recursively for nested composites) and
    /// clear the active scene.
    fn cascade_exit(self: &Rc<Self>, args: Rc<A>) -> Outcome {
        let NodeKind::Composite {
            children, current, ..
        } = &self.kind
        else {
            unreachable!("cascade exit on leaf node");
        };

        if self.transitioning.get() {
            trace!(node = %self.id, "exit rejected: already in flight");
            return Outcome::settled(false);
        }
        let Some(active) = current.borrow().clone() else {
            return Outcome::settled(true); // nothing entered, nothing to exit
        };

        self.transitioning.set(true);
        let outcome = Outcome::open();
        *self.pending.borrow_mut() = Some(outcome.clone());

        let child = children
            .borrow()
            .get(&active)
            .cloned()
            .expect("active scene is always a child");
        let node = Rc::clone(self);
        let gate = outcome.clone();
        child
            .request(lifecycle::EXIT, Rc::clone(&args))
            .on_settle(move |success| {
                if gate.is_settled() {
                    return;
                }
                node.transitioning.set(false);
                *node.pending.borrow_mut() = None;
                if success {
                    node.announce(lifecycle::EXIT, Some(active.clone()), &args);
                    node.announce(&scoped(&active, lifecycle::EXIT), Some(active), &args);
                    node.set_current(None);
                }
                gate.force(success);
            });

        outcome
    }
}

/// A hierarchical asynchronous state machine.
///
/// Handles refer to one node of the tree; `child` returns handles to nested
/// nodes. `Clone` builds an entirely new, independent tree (see
/// [`Storyboard::clone`]).
pub struct Storyboard<C = (), A = ()> {
    cell: Rc<NodeCell<C, A>>,
}

impl<C: 'static, A: 'static> Storyboard<C, A> {
    pub(crate) fn from_cell(cell: Rc<NodeCell<C, A>>) -> Self {
        Self { cell }
    }

    pub(crate) fn into_cell(self) -> Rc<NodeCell<C, A>> {
        self.cell
    }

    /// Process-unique identifier of this node.
    pub fn id(&self) -> NodeId {
        self.cell.id
    }

    /// Name of this node within its parent; `None` for a root.
    pub fn scene_name(&self) -> Option<String> {
        self.cell.name.borrow().clone()
    }

    /// Enter the initial scene.
    ///
    /// Idempotent: once the first transition has completed successfully,
    /// further calls return an already-successful [`Outcome`] and perform no
    /// side effects.
    pub fn start(&self) -> Outcome
    where
        A: Default,
    {
        if self.cell.current_name().is_some() {
            return Outcome::settled(true);
        }
        let target = self.cell.entry_target().to_string();
        self.cell.request(&target, Rc::new(A::default()))
    }

    /// Transition to the named scene, forwarding `args` to every handler
    /// involved.
    ///
    /// A request made while another transition is in flight settles failed
    /// immediately; it is never queued.
    ///
    /// # Panics
    ///
    /// Panics if `scene` does not exist on this node. An unresolvable
    /// target is a programming error, not a failed transition.
    pub fn transition_to(&self, scene: &str, args: A) -> Outcome {
        self.cell.request(scene, Rc::new(args))
    }

    /// Force-settle the in-flight transition as failed.
    ///
    /// Cooperative only: handler code that is already running is not
    /// interrupted, and its eventual completion signal is discarded.
    pub fn cancel_transition(&self) {
        let pending = self.cell.pending.borrow_mut().take();
        if let Some(outcome) = pending {
            debug!(node = %self.cell.id, "transition cancelled");
            self.cell.transitioning.set(false);
            outcome.force(false);
        }
    }

    /// The active scene (composite) or state (leaf); `None` before the
    /// first completed transition.
    pub fn current_state(&self) -> Option<String> {
        self.cell.current_name()
    }

    /// Whether the active scene/state is `name`.
    pub fn is_currently(&self, name: &str) -> bool {
        self.cell.current_name().as_deref() == Some(name)
    }

    /// Whether a transition is in flight on this node.
    pub fn is_transitioning(&self) -> bool {
        self.cell.transitioning.get()
    }

    /// Whether `scene` names a transition target this node would accept
    /// right now.
    pub fn can_transition(&self, scene: &str) -> bool {
        if self.cell.transitioning.get() {
            return false;
        }
        match &self.cell.kind {
            NodeKind::Composite { children, .. } => children.borrow().contains_key(scene),
            NodeKind::Leaf { .. } => scene == lifecycle::ENTER || scene == lifecycle::EXIT,
        }
    }

    /// Names of this node's child scenes, sorted; empty for a leaf.
    pub fn scenes(&self) -> Vec<String> {
        match &self.cell.kind {
            NodeKind::Composite { children, .. } => {
                let mut names: Vec<String> = children.borrow().keys().cloned().collect();
                names.sort();
                names
            }
            NodeKind::Leaf { .. } => Vec::new(),
        }
    }

    /// Handle to a child scene's node.
    pub fn child(&self, scene: &str) -> Option<Storyboard<C, A>> {
        match &self.cell.kind {
            NodeKind::Composite { children, .. } => children
                .borrow()
                .get(scene)
                .map(|cell| Storyboard::from_cell(Rc::clone(cell))),
            NodeKind::Leaf { .. } => None,
        }
    }

    /// Settled transition attempts on this node, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        match &self.cell.kind {
            NodeKind::Composite { history, .. } => history.borrow().to_vec(),
            NodeKind::Leaf { .. } => Vec::new(),
        }
    }

    pub fn clear_history(&self) {
        if let NodeKind::Composite { history, .. } = &self.cell.kind {
            history.borrow_mut().clear();
        }
    }

    /// Install an explicit context on this node. Descendants without their
    /// own explicit context see it immediately.
    pub fn set_context(&self, context: C) {
        self.cell.install_context(context, true);
    }

    /// The context cell handlers of this node run against.
    pub fn context(&self) -> SharedContext<C> {
        self.cell.resolved_context()
    }

    /// Run a helper registered at build time against this node's context.
    /// Returns `false` when no helper of that name exists.
    pub fn invoke(&self, helper: &str, args: &A) -> bool {
        let Some(helper) = self.cell.helpers.get(helper).cloned() else {
            return false;
        };
        let context = self.cell.resolved_context();
        let mut context = context.borrow_mut();
        helper(&mut context, args);
        true
    }

    /// Publish an application event on this node's bus (and, bubbled, on
    /// every ancestor's).
    pub fn publish(&self, event: &str, args: A) {
        self.cell.announce(event, None, &Rc::new(args));
    }

    /// Subscribe to an event at the default priority.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Token
    where
        F: Fn(&Notice<A>) + 'static,
    {
        self.cell.bus.subscribe(event, callback)
    }

    /// Subscribe with an explicit priority and/or caller-supplied token.
    pub fn subscribe_with<F>(&self, event: &str, options: SubscribeOptions, callback: F) -> Token
    where
        F: Fn(&Notice<A>) + 'static,
    {
        self.cell.bus.subscribe_with(event, options, callback)
    }

    /// Subscribe a callback that fires at most once.
    pub fn subscribe_once<F>(&self, event: &str, callback: F) -> Token
    where
        F: Fn(&Notice<A>) + 'static,
    {
        self.cell.bus.subscribe_once(event, callback)
    }

    /// Remove the subscription identified by `token`.
    pub fn unsubscribe(&self, event: &str, token: Token) -> bool {
        self.cell.bus.unsubscribe(event, token)
    }

    /// Remove every subscription for `event`.
    pub fn unsubscribe_all(&self, event: &str) -> usize {
        self.cell.bus.unsubscribe_all(event)
    }

    /// Number of live subscriptions for `event` on this node.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.cell.bus.subscriber_count(event)
    }
}

impl<C: 'static, A: 'static> Clone for Storyboard<C, A> {
    /// Build an entirely new, independent tree from this node's structure.
    ///
    /// Handler closures and context cells are shared immutably; active
    /// scenes, in-flight transitions, history, and subscriptions are all
    /// fresh.
    fn clone(&self) -> Self {
        Storyboard {
            cell: self.cell.deep_clone(),
        }
    }
}

impl<C, A> fmt::Debug for Storyboard<C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storyboard")
            .field("id", &self.cell.id)
            .field("name", &*self.cell.name.borrow())
            .field("transitioning", &self.cell.transitioning.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Scene, StoryboardBuilder};
    use crate::outcome::Outcome;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Context collecting the order handlers ran in.
    #[derive(Default)]
    struct Journal {
        entries: Vec<String>,
    }

    impl Journal {
        fn note(&mut self, entry: &str) {
            self.entries.push(entry.to_string());
        }
    }

    fn two_scene_board() -> Storyboard<Journal> {
        StoryboardBuilder::new()
            .initial("idle")
            .scene(
                "idle",
                Scene::new()
                    .on_enter(|j: &mut Journal, _: &()| {
                        j.note("idle.enter");
                        true
                    })
                    .on_exit(|j: &mut Journal, _: &()| {
                        j.note("idle.exit");
                        true
                    }),
            )
            .scene(
                "running",
                Scene::new()
                    .on_enter(|j: &mut Journal, _: &()| {
                        j.note("running.enter");
                        true
                    })
                    .on_exit(|j: &mut Journal, _: &()| {
                        j.note("running.exit");
                        true
                    }),
            )
            .build()
            .unwrap()
    }

    fn entries<A: 'static>(board: &Storyboard<Journal, A>) -> Vec<String> {
        board.context().borrow().entries.clone()
    }

    #[test]
    fn test_start_enters_initial_scene() {
        let board = two_scene_board();
        assert_eq!(board.current_state(), None);

        let outcome = board.start();

        assert_eq!(outcome.result(), Some(true));
        assert!(board.is_currently("idle"));
        assert_eq!(entries(&board), vec!["idle.enter"]);
    }

    #[test]
    fn test_start_is_idempotent() {
        let board = two_scene_board();
        board.start();
        let again = board.start();

        assert_eq!(again.result(), Some(true));
        assert_eq!(entries(&board), vec!["idle.enter"]);
    }

    #[test]
    fn test_transition_switches_scenes() {
        let board = two_scene_board();
        board.start();

        let outcome = board.transition_to("running", ());

        assert_eq!(outcome.result(), Some(true));
        assert!(board.is_currently("running"));
        assert_eq!(
            entries(&board),
            vec!["idle.enter", "idle.exit", "running.enter"]
        );
    }

    #[test]
    fn test_round_trip_restores_scene_and_runs_each_handler_once() {
        let board = two_scene_board();
        board.start();
        board.context().borrow_mut().entries.clear();

        board.transition_to("running", ());
        board.transition_to("idle", ());

        assert!(board.is_currently("idle"));
        assert_eq!(
            entries(&board),
            vec!["idle.exit", "running.enter", "running.exit", "idle.enter"]
        );
    }

    #[test]
    fn test_failing_enter_rolls_back_and_publishes_fail() {
        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut Journal, _: &()| true))
            .scene(
                "running",
                Scene::new().on_enter(|_: &mut Journal, _: &()| false),
            )
            .build()
            .unwrap();
        board.start();

        let failed = Rc::new(RefCell::new(Vec::new()));
        let sink = failed.clone();
        board.subscribe(lifecycle::FAIL, move |notice| {
            sink.borrow_mut().push(notice.scene().unwrap().to_string());
        });

        let outcome = board.transition_to("running", ());

        assert_eq!(outcome.result(), Some(false));
        assert!(board.is_currently("idle"));
        assert!(!board.is_transitioning());
        assert_eq!(*failed.borrow(), vec!["running"]);
    }

    #[test]
    fn test_failing_exit_bypasses_enter() {
        let entered = Rc::new(RefCell::new(false));
        let flag = entered.clone();
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut (), _: &()| false))
            .scene(
                "running",
                Scene::new().on_enter(move |_: &mut (), _: &()| {
                    *flag.borrow_mut() = true;
                    true
                }),
            )
            .build()
            .unwrap();
        board.start();

        let outcome = board.transition_to("running", ());

        assert_eq!(outcome.result(), Some(false));
        assert!(board.is_currently("idle"));
        assert!(!*entered.borrow());
    }

    #[test]
    #[should_panic(expected = "has no scene `missing`")]
    fn test_unknown_scene_panics() {
        let board = two_scene_board();
        board.start();
        board.transition_to("missing", ());
    }

    #[test]
    fn test_reentrant_transition_is_rejected() {
        let settle_slot: Rc<RefCell<Option<crate::Settle>>> = Rc::new(RefCell::new(None));
        let slot = settle_slot.clone();
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut (), _: &()| true))
            .scene(
                "running",
                Scene::new().on_enter(move |_: &mut (), _: &()| {
                    let (outcome, settle) = Outcome::deferred();
                    *slot.borrow_mut() = Some(settle);
                    Flow::Pending(outcome)
                }),
            )
            .build()
            .unwrap();
        board.start();

        let first = board.transition_to("running", ());
        assert!(board.is_transitioning());

        let second = board.transition_to("idle", ());
        assert_eq!(second.result(), Some(false));
        assert!(board.is_currently("idle"));

        settle_slot.borrow_mut().take().unwrap().done();
        assert_eq!(first.result(), Some(true));
        assert!(board.is_currently("running"));
    }

    #[test]
    fn test_async_enter_failure_matches_synchronous_failure() {
        let settle_slot: Rc<RefCell<Option<crate::Settle>>> = Rc::new(RefCell::new(None));
        let slot = settle_slot.clone();
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut (), _: &()| true))
            .scene(
                "running",
                Scene::new().on_enter(move |_: &mut (), _: &()| {
                    let (outcome, settle) = Outcome::deferred();
                    *slot.borrow_mut() = Some(settle);
                    Flow::Pending(outcome)
                }),
            )
            .build()
            .unwrap();
        board.start();

        let outcome = board.transition_to("running", ());
        assert!(!outcome.is_settled());

        settle_slot.borrow_mut().take().unwrap().fail();

        assert_eq!(outcome.result(), Some(false));
        assert!(board.is_currently("idle"));
        assert!(!board.is_transitioning());
    }

    #[test]
    fn test_cancel_discards_late_completion() {
        let settle_slot: Rc<RefCell<Option<crate::Settle>>> = Rc::new(RefCell::new(None));
        let slot = settle_slot.clone();
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut (), _: &()| true))
            .scene(
                "running",
                Scene::new().on_enter(move |_: &mut (), _: &()| {
                    let (outcome, settle) = Outcome::deferred();
                    *slot.borrow_mut() = Some(settle);
                    Flow::Pending(outcome)
                }),
            )
            .build()
            .unwrap();
        board.start();

        let ended = Rc::new(RefCell::new(0));
        let count = ended.clone();
        board.subscribe(lifecycle::END, move |_| *count.borrow_mut() += 1);

        let outcome = board.transition_to("running", ());
        board.cancel_transition();

        assert_eq!(outcome.result(), Some(false));
        assert!(!board.is_transitioning());

        // The handler finishes anyway; its signal must change nothing here.
        settle_slot.borrow_mut().take().unwrap().done();
        assert!(board.is_currently("idle"));
        assert_eq!(*ended.borrow(), 0);
    }

    #[test]
    fn test_lifecycle_event_sequence() {
        let board = two_scene_board();
        board.start();

        let log = Rc::new(RefCell::new(Vec::new()));
        for event in [
            lifecycle::START,
            lifecycle::EXIT,
            lifecycle::ENTER,
            lifecycle::END,
            lifecycle::FAIL,
            "idle:exit",
            "running:enter",
            "running:start",
            "running:end",
        ] {
            let sink = log.clone();
            board.subscribe(event, move |_| sink.borrow_mut().push(event));
        }

        board.transition_to("running", ());

        assert_eq!(
            *log.borrow(),
            vec!["start", "exit", "idle:exit", "enter", "running:enter", "end"]
        );
    }

    #[test]
    fn test_nested_storyboard_enters_its_initial_scene() {
        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .initial("menu")
            .scene("menu", Scene::new().on_exit(|_: &mut Journal, _: &()| true))
            .scene(
                "game",
                StoryboardBuilder::new().initial("loading").scene(
                    "loading",
                    Scene::new().on_enter(|j: &mut Journal, _: &()| {
                        j.note("loading.enter");
                        true
                    }),
                ),
            )
            .build()
            .unwrap();
        board.start();

        let outcome = board.transition_to("game", ());

        assert_eq!(outcome.result(), Some(true));
        assert!(board.is_currently("game"));
        let game = board.child("game").unwrap();
        assert!(game.is_currently("loading"));
        assert_eq!(entries(&board), vec!["loading.enter"]);
    }

    #[test]
    fn test_leaving_nested_storyboard_cascades_exit() {
        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .initial("menu")
            .scene(
                "menu",
                Scene::new().on_enter(|_: &mut Journal, _: &()| true),
            )
            .scene(
                "game",
                StoryboardBuilder::new().initial("loading").scene(
                    "loading",
                    Scene::new().on_exit(|j: &mut Journal, _: &()| {
                        j.note("loading.exit");
                        true
                    }),
                ),
            )
            .build()
            .unwrap();
        board.start();
        board.transition_to("game", ());

        let outcome = board.transition_to("menu", ());

        assert_eq!(outcome.result(), Some(true));
        assert!(board.is_currently("menu"));
        let game = board.child("game").unwrap();
        assert_eq!(game.current_state(), None);
        assert!(entries(&board).contains(&"loading.exit".to_string()));
    }

    #[test]
    fn test_events_bubble_to_the_root() {
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("game")
            .scene(
                "game",
                StoryboardBuilder::new()
                    .initial("loading")
                    .scene("loading", Scene::new().on_enter(|_: &mut (), _: &()| true)),
            )
            .build()
            .unwrap();

        let sources = Rc::new(RefCell::new(Vec::new()));
        let sink = sources.clone();
        board.subscribe(lifecycle::END, move |notice| {
            sink.borrow_mut().push(notice.source());
        });

        board.start();

        let game = board.child("game").unwrap();
        // Inner `end` (bubbled) arrives before the root's own.
        assert_eq!(*sources.borrow(), vec![game.id(), board.id()]);
    }

    #[test]
    fn test_application_events_bubble() {
        let board = two_scene_board();
        let idle = board.child("idle").unwrap();

        let heard = Rc::new(RefCell::new(0));
        let count = heard.clone();
        board.subscribe("saved", move |_| *count.borrow_mut() += 1);

        idle.publish("saved", ());
        assert_eq!(*heard.borrow(), 1);
    }

    #[test]
    fn test_clone_is_independent() {
        let board = two_scene_board();
        board.start();

        let copy = board.clone();
        assert_ne!(copy.id(), board.id());
        assert_eq!(copy.current_state(), None);

        let heard = Rc::new(RefCell::new(0));
        let count = heard.clone();
        board.subscribe(lifecycle::END, move |_| *count.borrow_mut() += 1);

        copy.start();
        copy.transition_to("running", ());

        assert!(copy.is_currently("running"));
        assert!(board.is_currently("idle"));
        assert_eq!(*heard.borrow(), 0);
    }

    #[test]
    fn test_leaf_storyboard_runs_its_own_handlers() {
        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .on_enter(|j: &mut Journal, _: &()| {
                j.note("enter");
                true
            })
            .on_exit(|j: &mut Journal, _: &()| {
                j.note("exit");
                true
            })
            .build()
            .unwrap();

        board.start();
        assert!(board.is_currently("enter"));

        board.transition_to("exit", ());
        assert!(board.is_currently("exit"));
        assert_eq!(entries(&board), vec!["enter", "exit"]);
    }

    #[test]
    fn test_leaf_handler_returning_false_keeps_state() {
        let board: Storyboard<()> = StoryboardBuilder::new()
            .on_enter(|_: &mut (), _: &()| false)
            .build()
            .unwrap();

        let outcome = board.start();

        assert_eq!(outcome.result(), Some(false));
        assert_eq!(board.current_state(), None);
        assert!(!board.is_transitioning());
    }

    #[test]
    fn test_helpers_run_against_the_context() {
        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .on_enter(|_: &mut Journal, _: &()| true)
            .helper("mark", |j: &mut Journal, _: &()| j.note("marked"))
            .build()
            .unwrap();

        assert!(board.invoke("mark", &()));
        assert!(!board.invoke("absent", &()));
        assert_eq!(entries(&board), vec!["marked"]);
    }

    #[test]
    fn test_set_context_is_seen_by_descendants() {
        let board = two_scene_board();
        board.start();

        board.set_context(Journal::default());
        board.transition_to("running", ());

        // Only the entries written after the swap are on the new context.
        assert_eq!(entries(&board), vec!["idle.exit", "running.enter"]);
    }

    #[test]
    fn test_transition_args_reach_handlers_and_notices() {
        let board: Storyboard<Journal, String> = StoryboardBuilder::new()
            .initial("idle")
            .scene(
                "idle",
                Scene::new().on_exit(|_: &mut Journal, _: &String| true),
            )
            .scene(
                "running",
                Scene::new().on_enter(|j: &mut Journal, args: &String| {
                    j.note(args);
                    true
                }),
            )
            .build()
            .unwrap();
        board.start();

        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        board.subscribe(lifecycle::END, move |notice: &Notice<String>| {
            sink.borrow_mut().push_str(notice.args());
        });

        board.transition_to("running", "fast".to_string());

        assert_eq!(entries(&board), vec!["fast"]);
        assert_eq!(*seen.borrow(), "fast");
    }

    #[test]
    fn test_can_transition_and_scenes() {
        let board = two_scene_board();
        assert_eq!(board.scenes(), vec!["idle", "running"]);
        assert!(board.can_transition("running"));
        assert!(!board.can_transition("missing"));
    }

    #[test]
    fn test_history_records_settled_attempts() {
        let board: Storyboard<()> = StoryboardBuilder::new()
            .initial("idle")
            .scene("idle", Scene::new().on_exit(|_: &mut (), _: &()| true))
            .scene(
                "running",
                Scene::new().on_enter(|_: &mut (), _: &()| false),
            )
            .build()
            .unwrap();

        board.start();
        board.transition_to("running", ());

        assert_eq!(
            board.history(),
            vec![
                TransitionRecord {
                    from: None,
                    to: "idle".to_string(),
                    succeeded: true,
                },
                TransitionRecord {
                    from: Some("idle".to_string()),
                    to: "running".to_string(),
                    succeeded: false,
                },
            ]
        );

        board.clear_history();
        assert!(board.history().is_empty());
    }

    #[test]
    fn test_prebuilt_storyboard_reused_as_scene() {
        let inner: Storyboard<Journal> = StoryboardBuilder::new()
            .initial("ready")
            .scene(
                "ready",
                Scene::new().on_enter(|j: &mut Journal, _: &()| {
                    j.note("ready.enter");
                    true
                }),
            )
            .build()
            .unwrap();

        let board: Storyboard<Journal> = StoryboardBuilder::new()
            .initial("sub")
            .scene("sub", inner)
            .build()
            .unwrap();

        board.start();

        assert!(board.is_currently("sub"));
        let sub = board.child("sub").unwrap();
        assert_eq!(sub.scene_name(), Some("sub".to_string()));
        assert!(sub.is_currently("ready"));
        // The prebuilt root inherits the outer tree's context.
        assert_eq!(entries(&board), vec!["ready.enter"]);
    }
}
