//! Shutdown coordination for the proxy.
//!
//! A single watch channel carries the dispatcher state. Every long-running
//! task (accept loop, connection drivers, WebSocket tunnels) holds a
//! [`ShutdownSignal`] and reacts to transitions:
//!
//! ```text
//! Running ──stop()──▶ Draining ──deadline / stop(true)──▶ Forced
//!    └───────────────stop(true)──────────────────────────────▲
//! ```
//!
//! Draining connections finish in-flight work; forced ones are dropped.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Draining,
    Forced,
}

/// Coordinator owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<ShutdownState>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ShutdownState::Running);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Move to `state`. Transitions never go backwards.
    pub fn trigger(&self, state: ShutdownState) {
        self.tx.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> ShutdownState {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side held by tasks.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownState>,
}

impl ShutdownSignal {
    pub fn state(&self) -> ShutdownState {
        *self.rx.borrow()
    }

    /// Resolve once the state is at least `state`.
    ///
    /// Never resolves if the coordinator is dropped first.
    pub async fn reached(&mut self, state: ShutdownState) {
        if self.rx.wait_for(|current| *current >= state).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolve on the next transition and return the new state.
    pub async fn changed(&mut self) -> ShutdownState {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signals_reach_states_in_order() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        assert_eq!(signal.state(), ShutdownState::Running);

        shutdown.trigger(ShutdownState::Draining);
        tokio::time::timeout(Duration::from_secs(1), signal.reached(ShutdownState::Draining))
            .await
            .unwrap();

        shutdown.trigger(ShutdownState::Forced);
        assert_eq!(signal.changed().await, ShutdownState::Forced);
    }

    #[test]
    fn never_goes_backwards() {
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownState::Forced);
        shutdown.trigger(ShutdownState::Draining);
        assert_eq!(shutdown.state(), ShutdownState::Forced);
    }
}
