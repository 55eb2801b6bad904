//! Hierarchical state machine core.
//!
//! A machine is described by a static transition table keyed by
//! (state, event). States form a tree through [State::parent]; an event
//! posted to the machine is matched against the current state first and
//! then against each of its ancestors, so a transition declared on a
//! superstate applies in every state nested below it.
//!
//! The machine itself only tracks the current state and computes, for each
//! consumed event, the ordered lists of states exited and entered. The
//! owner drains those lists and runs its entry and exit actions, which may
//! post further events; delivery is FIFO.

use std::{collections::VecDeque, fmt::Debug};

/// A state in a hierarchical state machine.
pub(crate) trait State: Copy + Eq + Debug + 'static {
    /// The superstate this state is nested in, if any.
    fn parent(self) -> Option<Self>;
}

/// The states exited and entered while consuming one event.
///
/// Exited states are ordered innermost first; entered states outermost
/// first.
pub(crate) struct Transition<S> {
    pub exited: Vec<S>,
    pub entered: Vec<S>,
}

pub(crate) struct StateMachine<S: State, E: Copy + Debug + 'static> {
    name: &'static str,
    transitions: &'static [(S, E, S)],
    initial: S,
    final_state: S,
    current: Option<S>,
    queue: VecDeque<E>,
}

impl<S: State, E: Copy + Eq + Debug + 'static> StateMachine<S, E> {
    pub fn new(name: &'static str, transitions: &'static [(S, E, S)], initial: S, final_state: S) -> Self {
        Self { name, transitions, initial, final_state, current: None, queue: VecDeque::new() }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<S> {
        self.current
    }

    /// Returns `true` if the machine is in the given state or in any state
    /// nested below it.
    pub fn in_state(&self, state: S) -> bool {
        let mut cursor = self.current;
        while let Some(s) = cursor {
            if s == state {
                return true;
            }
            cursor = s.parent();
        }
        false
    }

    /// Changes the state entered by the next [start](Self::start) call.
    ///
    /// Only permitted while the machine is stopped.
    pub fn set_initial_state(&mut self, state: S) {
        if self.is_running() {
            log::warn!("{}: cannot change initial state while running", self.name);
            return;
        }
        self.initial = state;
    }

    /// Starts the machine, returning the entry path into the initial
    /// state (outermost superstate first).
    pub fn start(&mut self) -> Vec<S> {
        if self.is_running() {
            log::warn!("{}: state machine already running", self.name);
            return Vec::new();
        }
        self.queue.clear();
        self.current = Some(self.initial);
        log::info!("{}: started in state {:?}", self.name, self.initial);
        let entered = ancestor_path(self.initial);
        if self.initial == self.final_state {
            self.current = None;
        }
        entered
    }

    /// Posts an event to the back of the machine's queue.
    ///
    /// Events posted while the machine is stopped are discarded.
    pub fn post(&mut self, event: E) {
        if !self.is_running() {
            return;
        }
        self.queue.push_back(event);
    }

    /// Consumes queued events until one causes a transition, and returns
    /// it. Returns `None` once the queue is drained or the machine has
    /// stopped.
    pub fn next(&mut self) -> Option<Transition<S>> {
        loop {
            let current = self.current?;
            let event = self.queue.pop_front()?;

            let Some(target) = self.lookup(current, event) else {
                log::debug!("{}: no transition from {:?} on {:?}", self.name, current, event);
                continue;
            };

            log::info!("{}: {:?} -> {:?} on {:?}", self.name, current, target, event);

            let transition = transition_paths(current, target);
            self.current = Some(target);
            if target == self.final_state {
                self.current = None;
                self.queue.clear();
            }
            return Some(transition);
        }
    }

    fn lookup(&self, state: S, event: E) -> Option<S> {
        let mut cursor = Some(state);
        while let Some(s) = cursor {
            if let Some((_, _, target)) = self.transitions.iter().find(|(from, ev, _)| *from == s && *ev == event) {
                return Some(*target);
            }
            cursor = s.parent();
        }
        None
    }
}

/// Path from the outermost ancestor down to (and including) `state`.
fn ancestor_path<S: State>(state: S) -> Vec<S> {
    let mut path = vec![state];
    let mut cursor = state.parent();
    while let Some(s) = cursor {
        path.push(s);
        cursor = s.parent();
    }
    path.reverse();
    path
}

/// Computes the exit and entry paths between two leaf states, splitting at
/// their deepest common ancestor.
fn transition_paths<S: State>(from: S, to: S) -> Transition<S> {
    let from_path = ancestor_path(from);
    let to_path = ancestor_path(to);

    let mut common = 0;
    while common < from_path.len() && common < to_path.len() && from_path[common] == to_path[common] {
        common += 1;
    }

    let mut exited: Vec<S> = from_path[common..].to_vec();
    exited.reverse();
    let entered: Vec<S> = to_path[common..].to_vec();

    Transition { exited, entered }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum TestState {
        Top,
        Inner,
        A,
        B,
        C,
        Done,
    }

    impl State for TestState {
        fn parent(self) -> Option<Self> {
            match self {
                TestState::Inner => Some(TestState::Top),
                TestState::A | TestState::B => Some(TestState::Inner),
                TestState::C => Some(TestState::Top),
                TestState::Top | TestState::Done => None,
            }
        }
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum TestEvent {
        Step,
        Leave,
        Abort,
    }

    const TRANSITIONS: &[(TestState, TestEvent, TestState)] = &[
        (TestState::Top, TestEvent::Abort, TestState::Done),
        (TestState::A, TestEvent::Step, TestState::B),
        (TestState::Inner, TestEvent::Leave, TestState::C),
    ];

    fn machine() -> StateMachine<TestState, TestEvent> {
        StateMachine::new("test", TRANSITIONS, TestState::A, TestState::Done)
    }

    #[test]
    fn start_enters_superstates_outermost_first() {
        let mut sm = machine();
        let entered = sm.start();
        assert_eq!(entered, vec![TestState::Top, TestState::Inner, TestState::A]);
        assert!(sm.is_running());
        assert!(sm.in_state(TestState::A));
        assert!(sm.in_state(TestState::Inner));
        assert!(sm.in_state(TestState::Top));
        assert!(!sm.in_state(TestState::B));
    }

    #[test]
    fn sibling_transition_stays_inside_the_superstate() {
        let mut sm = machine();
        sm.start();
        sm.post(TestEvent::Step);
        let tr = sm.next().unwrap();
        assert_eq!(tr.exited, vec![TestState::A]);
        assert_eq!(tr.entered, vec![TestState::B]);
        assert!(sm.next().is_none());
    }

    #[test]
    fn superstate_transition_applies_from_nested_states() {
        let mut sm = machine();
        sm.start();
        sm.post(TestEvent::Leave);
        let tr = sm.next().unwrap();
        assert_eq!(tr.exited, vec![TestState::A, TestState::Inner]);
        assert_eq!(tr.entered, vec![TestState::C]);
        assert_eq!(sm.current(), Some(TestState::C));
    }

    #[test]
    fn final_state_stops_the_machine() {
        let mut sm = machine();
        sm.start();
        sm.post(TestEvent::Abort);
        sm.post(TestEvent::Step);
        let tr = sm.next().unwrap();
        assert_eq!(tr.exited, vec![TestState::A, TestState::Inner, TestState::Top]);
        assert_eq!(tr.entered, vec![TestState::Done]);
        assert!(!sm.is_running());
        // the queued Step event was discarded with the stop
        assert!(sm.next().is_none());
    }

    #[test]
    fn unmatched_events_are_skipped() {
        let mut sm = machine();
        sm.start();
        sm.post(TestEvent::Leave);
        sm.post(TestEvent::Leave);
        assert!(sm.next().is_some());
        // second Leave has no transition from state C
        assert!(sm.next().is_none());
        assert!(sm.is_running());
    }

    #[test]
    fn initial_state_can_be_reset_while_stopped() {
        let mut sm = machine();
        sm.set_initial_state(TestState::B);
        let entered = sm.start();
        assert_eq!(entered, vec![TestState::Top, TestState::Inner, TestState::B]);
    }

    #[test]
    fn events_posted_while_stopped_are_discarded() {
        let mut sm = machine();
        sm.post(TestEvent::Step);
        sm.start();
        assert!(sm.next().is_none());
    }
}
