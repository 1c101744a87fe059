use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use gangway_core::ControlError;
use serde::{Deserialize, Serialize};

use crate::common::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseState {
    Running,
    Paused,
    Stopped,
}

/// What a gated request should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Proceed,
    TimedOut,
    Stopped(Option<String>),
}

struct Inner {
    state: PauseState,
    stop_message: Option<String>,
    deadline: Option<Instant>,
    /// Replaced and fired on every transition so that all blocked waiters
    /// re-evaluate at once.
    changed: Signal,
}

/// Per-service request gate: Running / Paused (with expiry) / Stopped.
///
/// Any number of requests may be blocked in [`wait`](Self::wait)
/// concurrently; a transition wakes them all.
#[derive(Clone)]
pub struct PauseController {
    inner: Rc<RefCell<Inner>>,
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseController {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: PauseState::Running,
                stop_message: None,
                deadline: None,
                changed: Signal::new(),
            })),
        }
    }

    pub fn state(&self) -> PauseState {
        self.inner.borrow().state
    }

    pub fn stop_message(&self) -> Option<String> {
        self.inner.borrow().stop_message.clone()
    }

    /// Running -> Paused with an expiry; waiting requests resolve
    /// `TimedOut` once the expiry passes.
    pub fn pause(&self, timeout: Duration) -> Result<(), ControlError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != PauseState::Running {
            return Err(ControlError::AlreadyPaused);
        }
        inner.state = PauseState::Paused;
        inner.deadline = Some(Instant::now() + timeout);
        Self::transitioned(&mut inner);
        Ok(())
    }

    /// Running|Paused -> Stopped. Re-stopping only refreshes the message.
    pub fn stop(&self, message: Option<String>) -> Result<(), ControlError> {
        let mut inner = self.inner.borrow_mut();
        inner.state = PauseState::Stopped;
        inner.stop_message = message;
        inner.deadline = None;
        Self::transitioned(&mut inner);
        Ok(())
    }

    /// Paused|Stopped -> Running.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == PauseState::Running {
            return Err(ControlError::NotPaused);
        }
        inner.state = PauseState::Running;
        inner.stop_message = None;
        inner.deadline = None;
        Self::transitioned(&mut inner);
        Ok(())
    }

    /// Re-install a persisted state on restore; waiters cannot exist yet.
    pub fn restore(&self, state: PauseState, message: Option<String>, pause_timeout: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.state = state;
        inner.stop_message = message;
        inner.deadline = match state {
            PauseState::Paused => Some(Instant::now() + pause_timeout),
            _ => None,
        };
    }

    /// Gate a request on the current state. Returns immediately while
    /// Running or Stopped; while Paused, blocks until a transition or the
    /// pause expiry.
    pub async fn wait(&self) -> WaitOutcome {
        loop {
            let (state, deadline, message, waiter) = {
                let inner = self.inner.borrow();
                (
                    inner.state,
                    inner.deadline,
                    inner.stop_message.clone(),
                    inner.changed.waiter(),
                )
            };
            match state {
                PauseState::Running => return WaitOutcome::Proceed,
                PauseState::Stopped => return WaitOutcome::Stopped(message),
                PauseState::Paused => {
                    let now = Instant::now();
                    let deadline = match deadline {
                        Some(deadline) if deadline > now => deadline,
                        _ => return WaitOutcome::TimedOut,
                    };
                    let mut waiter = waiter;
                    monoio::select! {
                        _ = &mut waiter => continue,
                        _ = monoio::time::sleep(deadline - now) => return WaitOutcome::TimedOut,
                    }
                }
            }
        }
    }

    fn transitioned(inner: &mut Inner) {
        let prev = std::mem::replace(&mut inner.changed, Signal::new());
        prev.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test(timer_enabled = true)]
    async fn running_proceeds_immediately() {
        let controller = PauseController::new();
        assert_eq!(controller.wait().await, WaitOutcome::Proceed);
    }

    #[monoio::test(timer_enabled = true)]
    async fn pause_then_resume_releases_waiters() {
        let controller = PauseController::new();
        controller.pause(Duration::from_secs(5)).unwrap();

        let gate = controller.clone();
        let waiting = monoio::spawn(async move { gate.wait().await });
        monoio::time::sleep(Duration::from_millis(10)).await;
        controller.resume().unwrap();
        assert_eq!(waiting.await, WaitOutcome::Proceed);
    }

    #[monoio::test(timer_enabled = true)]
    async fn pause_expiry_times_out_waiters() {
        let controller = PauseController::new();
        controller.pause(Duration::from_millis(20)).unwrap();
        assert_eq!(controller.wait().await, WaitOutcome::TimedOut);
        // Still paused after expiry: late arrivals time out immediately.
        assert_eq!(controller.state(), PauseState::Paused);
        assert_eq!(controller.wait().await, WaitOutcome::TimedOut);
    }

    #[monoio::test(timer_enabled = true)]
    async fn stop_reports_message_to_waiters() {
        let controller = PauseController::new();
        controller.pause(Duration::from_secs(5)).unwrap();

        let gate = controller.clone();
        let waiting = monoio::spawn(async move { gate.wait().await });
        monoio::time::sleep(Duration::from_millis(10)).await;
        controller.stop(Some("maintenance".to_string())).unwrap();
        assert_eq!(
            waiting.await,
            WaitOutcome::Stopped(Some("maintenance".to_string()))
        );
        assert_eq!(
            controller.wait().await,
            WaitOutcome::Stopped(Some("maintenance".to_string()))
        );
    }

    #[test]
    fn transition_errors() {
        let controller = PauseController::new();
        assert_eq!(controller.resume(), Err(ControlError::NotPaused));
        controller.pause(Duration::from_secs(1)).unwrap();
        assert_eq!(
            controller.pause(Duration::from_secs(1)),
            Err(ControlError::AlreadyPaused)
        );
        controller.stop(None).unwrap();
        assert_eq!(
            controller.pause(Duration::from_secs(1)),
            Err(ControlError::AlreadyPaused)
        );
        controller.resume().unwrap();
        assert_eq!(controller.state(), PauseState::Running);
    }
}
