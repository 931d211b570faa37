//! Step-based asynchronous state machine.
//!
//! A [`Transition`] walks through a sequence of steps chosen by a
//! [`TransitionSteps`] implementation. `Step::None` is both the initial
//! state and the success terminal; `Step::Error` is the failure terminal.
//!
//! Steps that complete asynchronously simply return from `execute_step`;
//! whatever finishes the work later calls [`Transition::advance`] again.
//! Calling `advance` from inside a step (synchronous completion) is allowed:
//! the outer call notices and keeps going, so steps of one transition never
//! nest.
//!
//! A transition keeps itself alive from its first `advance` until its
//! completion callback has run. Dropping every external handle does not
//! cancel it; the only early exit is [`Transition::return_error`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{error, trace, warn};

use crate::error::SessionError;

/// Position of a transition in its step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Step {
    #[default]
    None,
    Custom(u32),
    Error,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::None => write!(f, "none"),
            Step::Custom(n) => write!(f, "step-{n}"),
            Step::Error => write!(f, "error"),
        }
    }
}

/// Decides and performs the steps of one transition.
pub trait TransitionSteps {
    /// Pick the step that follows `step`.
    ///
    /// Returning `step` itself means the transition waits for an external
    /// completion. `Step::None` completes successfully, `Step::Error` fails.
    fn get_next_step(&mut self, transition: &Transition, step: Step) -> Step;

    /// Perform `step`. Also called once with `Step::Error` on failure so the
    /// implementation can roll back.
    fn execute_step(&mut self, transition: &Transition, step: Step);
}

type CompletionCallback = Box<dyn FnOnce(&Transition)>;

#[derive(Debug, Default)]
struct TransitionState {
    step: Step,
    started: bool,
    completed: bool,
    /// A step function is running further up the stack.
    busy: bool,
    /// `advance` was called while busy.
    reentered: bool,
    error: Option<SessionError>,
}

struct TransitionInner {
    label: String,
    state: RefCell<TransitionState>,
    steps: RefCell<Option<Box<dyn TransitionSteps>>>,
    callback: RefCell<Option<CompletionCallback>>,
    data: RefCell<Option<Box<dyn Any>>>,
    keepalive: RefCell<Option<Transition>>,
}

#[derive(Clone)]
pub struct Transition(Rc<TransitionInner>);

#[derive(Clone)]
pub struct WeakTransition(Weak<TransitionInner>);

impl WeakTransition {
    pub fn upgrade(&self) -> Option<Transition> {
        self.0.upgrade().map(Transition)
    }
}

impl Transition {
    /// Create a transition. Nothing happens until the first [`advance`](Self::advance).
    pub fn new(
        label: impl Into<String>,
        steps: impl TransitionSteps + 'static,
        callback: impl FnOnce(&Transition) + 'static,
    ) -> Self {
        Transition(Rc::new(TransitionInner {
            label: label.into(),
            state: RefCell::new(TransitionState::default()),
            steps: RefCell::new(Some(Box::new(steps))),
            callback: RefCell::new(Some(Box::new(callback))),
            data: RefCell::new(None),
            keepalive: RefCell::new(None),
        }))
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn downgrade(&self) -> WeakTransition {
        WeakTransition(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Transition) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn step(&self) -> Step {
        self.0.state.borrow().step
    }

    /// True once the completion callback has been (or is being) invoked.
    pub fn completed(&self) -> bool {
        self.0.state.borrow().completed
    }

    pub fn had_error(&self) -> bool {
        self.0.state.borrow().step == Step::Error
    }

    pub fn error(&self) -> Option<SessionError> {
        self.0.state.borrow().error.clone()
    }

    /// Attach opaque per-instance data, replacing any previous value.
    pub fn set_data<T: Any>(&self, data: T) {
        *self.0.data.borrow_mut() = Some(Box::new(data));
    }

    pub fn data<T: Any + Clone>(&self) -> Option<T> {
        self.0
            .data
            .borrow()
            .as_ref()
            .and_then(|d| d.downcast_ref::<T>())
            .cloned()
    }

    /// Move to the next step, or re-check a waiting one.
    pub fn advance(&self) {
        {
            let mut st = self.0.state.borrow_mut();
            if st.completed {
                trace!(transition = %self.0.label, "advance after completion ignored");
                return;
            }
            if st.busy {
                st.reentered = true;
                return;
            }
            st.busy = true;
            st.started = true;
        }

        {
            let mut keepalive = self.0.keepalive.borrow_mut();
            if keepalive.is_none() {
                *keepalive = Some(self.clone());
            }
        }

        self.run();
    }

    fn run(&self) {
        loop {
            let current = {
                let mut st = self.0.state.borrow_mut();
                st.reentered = false;
                if st.error.is_some() {
                    drop(st);
                    self.rollback();
                    return;
                }
                st.step
            };

            let Some(next) = self.with_steps(|steps| steps.get_next_step(self, current)) else {
                self.fail(SessionError::Invariant(format!(
                    "transition {} has no step handler",
                    self.0.label
                )));
                return;
            };

            if self.0.state.borrow().error.is_some() {
                self.rollback();
                return;
            }

            trace!(transition = %self.0.label, "{} -> {}", current, next);

            match next {
                Step::Error => {
                    self.fail(SessionError::Invariant("state machine error".to_string()));
                    return;
                }
                Step::None => {
                    self.0.state.borrow_mut().step = Step::None;
                    self.complete();
                    return;
                }
                s if s == current => {
                    // waiting for something external
                    self.0.state.borrow_mut().busy = false;
                    return;
                }
                s => {
                    self.0.state.borrow_mut().step = s;
                    trace!(transition = %self.0.label, "execute {}", s);
                    self.with_steps(|steps| steps.execute_step(self, s));

                    let mut st = self.0.state.borrow_mut();
                    if st.error.is_some() {
                        drop(st);
                        self.rollback();
                        return;
                    }
                    if !st.reentered {
                        st.busy = false;
                        return;
                    }
                }
            }
        }
    }

    /// Fail the transition. The first error wins; later calls are logged
    /// and ignored.
    ///
    /// When called from inside a step, the rollback and completion happen
    /// once that step returns.
    pub fn return_error(&self, error: SessionError) {
        let run_now = {
            let mut st = self.0.state.borrow_mut();
            if st.completed && st.error.is_none() {
                warn!(transition = %self.0.label, "error after successful completion ignored: {}", error);
                return;
            }
            if st.error.is_some() {
                warn!(
                    transition = %self.0.label,
                    "transition bailing out multiple times; new error is: {}", error
                );
                return;
            }
            if error.is_invariant() {
                error!(transition = %self.0.label, "{}", error);
            }
            st.step = Step::Error;
            st.error = Some(error);
            if st.busy {
                false
            } else {
                st.busy = true;
                true
            }
        };

        if run_now {
            self.rollback();
        }
    }

    /// Invariant failure raised by the engine itself.
    fn fail(&self, error: SessionError) {
        {
            let mut st = self.0.state.borrow_mut();
            if st.error.is_none() {
                error!(transition = %self.0.label, "{}", error);
                st.step = Step::Error;
                st.error = Some(error);
            }
        }
        self.rollback();
    }

    fn rollback(&self) {
        self.with_steps(|steps| steps.execute_step(self, Step::Error));
        self.complete();
    }

    fn complete(&self) {
        {
            let mut st = self.0.state.borrow_mut();
            st.completed = true;
            st.busy = false;
            match &st.error {
                Some(e) => trace!(transition = %self.0.label, "completed with error: {}", e),
                None => trace!(transition = %self.0.label, "completed"),
            }
        }

        let callback = self.0.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(self);
        }

        // Release the step handler and the self-reference only after the
        // callback ran; either may hold the last reference to something.
        let steps = self.0.steps.borrow_mut().take();
        let keepalive = self.0.keepalive.borrow_mut().take();
        drop(steps);
        drop(keepalive);
    }

    fn with_steps<R>(&self, f: impl FnOnce(&mut dyn TransitionSteps) -> R) -> Option<R> {
        let mut steps = self.0.steps.borrow_mut().take()?;
        let result = f(steps.as_mut());
        *self.0.steps.borrow_mut() = Some(steps);
        Some(result)
    }

    /// Final status, meant for the completion callback.
    pub fn finish(&self) -> Result<(), SessionError> {
        let mut st = self.0.state.borrow_mut();
        if let Some(e) = &st.error {
            return Err(e.clone());
        }
        if !st.started {
            let e = SessionError::Invariant("finished before starting".to_string());
            st.step = Step::Error;
            st.error = Some(e.clone());
            return Err(e);
        }
        if !st.completed {
            return Err(SessionError::Invariant(
                "finished before completion".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.0.state.borrow();
        f.debug_struct("Transition")
            .field("label", &self.0.label)
            .field("step", &st.step)
            .field("started", &st.started)
            .field("completed", &st.completed)
            .field("error", &st.error)
            .finish()
    }
}
