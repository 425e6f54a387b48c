//! Shutdown coordination.
//!
//! A linear state machine, `Running → Draining → Stopped`, with no cycles
//! and no re-entry. The first SIGINT or SIGTERM moves the process into
//! `Draining`; the serving loop reacts by closing the listener, draining
//! in-flight requests under a bounded budget, then waiting for the
//! background-task supervisor. Repeat signals are logged and ignored; the
//! drain stays graceful, there is no forced-termination escalation.

use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    phase: watch::Sender<Phase>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self { phase }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// First-signal-wins transition into `Draining`. Returns whether this
    /// call performed the transition.
    pub fn begin_drain(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Final transition, only reachable from `Draining`.
    pub fn mark_stopped(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Draining {
                *phase = Phase::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the coordinator has left `Running`.
    pub async fn draining(&self) {
        let mut rx = self.phase.subscribe();
        // wait_for checks the current value first, so a transition that
        // already happened still resolves
        let _ = rx.wait_for(|phase| *phase != Phase::Running).await;
    }

    /// Install the OS signal listener. Both termination signals trigger the
    /// same graceful transition; anything after the first is ignored.
    pub fn spawn_signal_listener(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = listen(&coordinator).await {
                error!(error = %err, "failed to install signal handlers");
            }
        })
    }
}

#[cfg(unix)]
async fn listen(coordinator: &ShutdownCoordinator) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let caught = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };

        if coordinator.begin_drain() {
            info!(signal = caught, "caught signal, draining");
        } else {
            warn!(signal = caught, "already draining, signal ignored");
        }
    }
}

#[cfg(not(unix))]
async fn listen(coordinator: &ShutdownCoordinator) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        if coordinator.begin_drain() {
            info!(signal = "interrupt", "caught signal, draining");
        } else {
            warn!(signal = "interrupt", "already draining, signal ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transitions() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.phase(), Phase::Running);

        assert!(coordinator.begin_drain());
        assert_eq!(coordinator.phase(), Phase::Draining);

        // second signal does not re-enter or escalate
        assert!(!coordinator.begin_drain());
        assert_eq!(coordinator.phase(), Phase::Draining);

        assert!(coordinator.mark_stopped());
        assert_eq!(coordinator.phase(), Phase::Stopped);

        // no cycle back out of Stopped
        assert!(!coordinator.begin_drain());
        assert!(!coordinator.mark_stopped());
        assert_eq!(coordinator.phase(), Phase::Stopped);
    }

    #[test]
    fn test_stopped_is_unreachable_from_running() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.mark_stopped());
        assert_eq!(coordinator.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn test_draining_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.draining().await })
        };

        coordinator.begin_drain();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_draining_resolves_when_already_past_running() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.begin_drain();
        coordinator.draining().await;
    }
}
