//! The Initialize → Bind → Dispatch → Wait protocol.
//!
//! Graph-native and model-native dispatchables both implement
//! [`Dispatchable`]. [`Lifecycle`] wraps either and enforces call order, so an
//! implementation only has to do its work and never checks state itself.

use crate::binding::BindingSet;
use crate::{Error, Result};
use std::fmt;
use tracing::{debug, warn};

/// A unit of work that can be bound and dispatched repeatedly.
pub trait Dispatchable {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Compile against the device, consume initialization bindings, and create
    /// the persistent resource. Blocks until initialization work completes.
    fn initialize(&mut self) -> Result<()>;

    /// Prepare a fresh binding table for the next dispatch. Submits no work.
    fn bind(&mut self, bindings: &BindingSet) -> Result<()>;

    /// Submit work against the most recent binding table without waiting.
    fn dispatch(&mut self) -> Result<()>;

    /// Block until the most recent dispatch's outputs are readable.
    fn wait(&mut self) -> Result<()>;
}

impl<T: Dispatchable + ?Sized> Dispatchable for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn initialize(&mut self) -> Result<()> {
        (**self).initialize()
    }

    fn bind(&mut self, bindings: &BindingSet) -> Result<()> {
        (**self).bind(bindings)
    }

    fn dispatch(&mut self) -> Result<()> {
        (**self).dispatch()
    }

    fn wait(&mut self) -> Result<()> {
        (**self).wait()
    }
}

/// Where a dispatchable is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Constructed,
    Initialized,
    Bound,
    Dispatched,
    /// Initialization failed or the device was lost. Terminal.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Constructed => "constructed",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Bound => "bound",
            LifecycleState::Dispatched => "dispatched",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Enforces the lifecycle order around a [`Dispatchable`].
///
/// - `initialize` once, from `Constructed`
/// - `bind` after initialization, any number of times
/// - `dispatch` only directly after a successful `bind`
/// - `wait` after a dispatch; does not change state
///
/// A failed `bind` or `dispatch` leaves nothing usable bound, so the next call
/// must be another `bind`. Device loss moves to [`LifecycleState::Failed`].
#[derive(Debug)]
pub struct Lifecycle<T> {
    inner: T,
    state: LifecycleState,
    dispatches: u64,
}

impl<T: Dispatchable> Lifecycle<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            state: LifecycleState::Constructed,
            dispatches: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Successful dispatches so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state("initialize", &[LifecycleState::Constructed])?;
        match self.inner.initialize() {
            Ok(()) => self.transition(LifecycleState::Initialized),
            Err(err) => self.fail("initialize", err, LifecycleState::Failed),
        }
    }

    pub fn bind(&mut self, bindings: &BindingSet) -> Result<()> {
        self.expect_state(
            "bind",
            &[
                LifecycleState::Initialized,
                LifecycleState::Bound,
                LifecycleState::Dispatched,
            ],
        )?;
        match self.inner.bind(bindings) {
            Ok(()) => self.transition(LifecycleState::Bound),
            Err(err) => self.fail("bind", err, LifecycleState::Initialized),
        }
    }

    pub fn dispatch(&mut self) -> Result<()> {
        self.expect_state("dispatch", &[LifecycleState::Bound])?;
        match self.inner.dispatch() {
            Ok(()) => {
                self.dispatches += 1;
                self.transition(LifecycleState::Dispatched)
            }
            Err(err) => self.fail("dispatch", err, LifecycleState::Initialized),
        }
    }

    pub fn wait(&mut self) -> Result<()> {
        self.expect_state("wait", &[LifecycleState::Dispatched])?;
        match self.inner.wait() {
            Ok(()) => Ok(()),
            Err(err) => self.fail("wait", err, LifecycleState::Dispatched),
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[LifecycleState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::Lifecycle {
            name: self.inner.name().to_string(),
            operation,
            state: self.state,
        })
    }

    fn transition(&mut self, next: LifecycleState) -> Result<()> {
        debug!(name = self.inner.name(), from = %self.state, to = %next, "lifecycle");
        self.state = next;
        Ok(())
    }

    /// Record a failure. Device loss is always terminal; otherwise fall back to
    /// `recovered`.
    fn fail(&mut self, operation: &'static str, err: Error, recovered: LifecycleState) -> Result<()> {
        self.state = if err.is_device_lost() {
            LifecycleState::Failed
        } else {
            recovered
        };
        warn!(name = self.inner.name(), operation, state = %self.state, error = %err, "lifecycle call failed");
        Err(err)
    }
}
