use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

struct Inner {
    fired: bool,
    next_key: u64,
    wakers: HashMap<u64, Waker>,
}

/// One-shot broadcast signal for same-thread tasks.
///
/// Used for request cancellation (drain), inflight completion tracking,
/// health-loop shutdown and pause-state change notification: one side fires,
/// every registered [`Waiter`] wakes. Firing is idempotent and sticky.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                fired: false,
                next_key: 0,
                wakers: HashMap::new(),
            })),
        }
    }

    pub fn fire(&self) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if inner.fired {
                return;
            }
            inner.fired = true;
            std::mem::take(&mut inner.wakers)
        };
        // Wake outside the borrow: a woken task may poll (and re-borrow)
        // synchronously in some executors.
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    pub fn fired(&self) -> bool {
        self.inner.borrow().fired
    }

    pub fn waiter(&self) -> Waiter {
        Waiter {
            key: None,
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Future side of a [`Signal`]: resolves once the signal fires (or when the
/// signal was dropped entirely, which counts as fired).
pub struct Waiter {
    key: Option<u64>,
    inner: Weak<RefCell<Inner>>,
}

impl Future for Waiter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Poll::Ready(()),
        };
        let mut inner = inner.borrow_mut();
        if inner.fired {
            return Poll::Ready(());
        }
        match self.key {
            Some(key) => {
                inner
                    .wakers
                    .entry(key)
                    .and_modify(|w| w.clone_from(cx.waker()))
                    .or_insert_with(|| cx.waker().clone());
            }
            None => {
                let key = inner.next_key;
                inner.next_key += 1;
                inner.wakers.insert(key, cx.waker().clone());
                drop(inner);
                self.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let (Some(key), Some(inner)) = (self.key, self.inner.upgrade()) {
            inner.borrow_mut().wakers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test]
    async fn waiter_resolves_on_fire() {
        let signal = Signal::new();
        let waiter = signal.waiter();
        let task = monoio::spawn(async move {
            waiter.await;
            true
        });
        signal.fire();
        assert!(task.await);
        assert!(signal.fired());
    }

    #[monoio::test]
    async fn all_waiters_wake() {
        let signal = Signal::new();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let waiter = signal.waiter();
                monoio::spawn(async move { waiter.await })
            })
            .collect();
        signal.fire();
        for task in tasks {
            task.await;
        }
    }

    #[monoio::test]
    async fn waiter_after_fire_is_immediate() {
        let signal = Signal::new();
        signal.fire();
        signal.waiter().await;
    }

    #[monoio::test]
    async fn dropped_signal_releases_waiters() {
        let signal = Signal::new();
        let waiter = signal.waiter();
        drop(signal);
        waiter.await;
    }
}
