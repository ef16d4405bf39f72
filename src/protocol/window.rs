//! Sliding flow-control windows
//!
//! A [`Window`] is a shared credit counter. Producers that must wait for
//! credit use the async [`Window::take`]; the relay dispatcher uses the
//! non-blocking [`Window::try_take`]. Refills wake every waiter; which
//! waiter wins a freshly refilled credit is unspecified.

use std::sync::Mutex;

use tokio::sync::Notify;

struct WindowState {
    level: i64,
    aborted: bool,
}

/// A bounded credit counter with blocking and non-blocking acquire and a
/// broadcast abort.
pub struct Window {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl Window {
    pub fn new(initial: i64) -> Window {
        Window {
            state: Mutex::new(WindowState {
                level: initial,
                aborted: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Take one credit, waiting until one is available. Returns `false`
    /// once the window has been aborted and no credit remains.
    pub async fn take(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting the counter, so a
            // refill between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("window poisoned");
                if state.level > 0 {
                    state.level -= 1;
                    return true;
                }
                if state.aborted {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Take one credit without waiting.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock().expect("window poisoned");
        if state.level > 0 {
            state.level -= 1;
            true
        } else {
            false
        }
    }

    /// Add `count` credits and wake all waiters.
    pub fn refill(&self, count: i64) {
        let mut state = self.state.lock().expect("window poisoned");
        state.level += count;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wake all waiters; empty takes return `false` from now on.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("window poisoned");
        state.aborted = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn level(&self) -> i64 {
        self.state.lock().expect("window poisoned").level
    }
}
