//! Process signals mapped onto agent loop controls.
//!
//! | Signal          | Effect                         |
//! |-----------------|--------------------------------|
//! | SIGTERM, ctrl-c | stop the loop (cancels a run)  |
//! | SIGHUP          | run now                        |
//! | SIGUSR1         | configuration changed upstream |

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleet_core::TriggerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown,
    RunNow,
    ConfigChanged,
}

/// Apply one control. Returns `false` once the loop should stop listening.
pub fn apply(control: Control, triggers: &TriggerHandle, shutdown: &CancellationToken) -> bool {
    match control {
        Control::Shutdown => {
            info!("shutdown requested");
            shutdown.cancel();
            false
        }
        Control::RunNow => {
            if !triggers.run_now() {
                warn!("run request dropped; a run is already queued");
            }
            true
        }
        Control::ConfigChanged => {
            if !triggers.config_changed() {
                warn!("config push dropped; a run is already queued");
            }
            true
        }
    }
}

/// Install the handlers and forward signals until shutdown.
#[cfg(unix)]
pub fn spawn(triggers: TriggerHandle, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    use signal::unix::{signal as unix_signal, SignalKind};

    let mut terminate =
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hangup =
        unix_signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut user1 =
        unix_signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let control = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = signal::ctrl_c() => Control::Shutdown,
                _ = terminate.recv() => Control::Shutdown,
                _ = hangup.recv() => Control::RunNow,
                _ = user1.recv() => Control::ConfigChanged,
            };
            if !apply(control, &triggers, &shutdown) {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn(triggers: TriggerHandle, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = signal::ctrl_c() => {
                if result.is_ok() {
                    apply(Control::Shutdown, &triggers, &shutdown);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Trigger;

    #[tokio::test]
    async fn controls_map_to_triggers() {
        let (handle, mut rx) = TriggerHandle::channel(4);
        let shutdown = CancellationToken::new();

        assert!(apply(Control::RunNow, &handle, &shutdown));
        assert!(apply(Control::ConfigChanged, &handle, &shutdown));
        assert_eq!(rx.recv().await, Some(Trigger::RunNow));
        assert_eq!(rx.recv().await, Some(Trigger::ConfigChanged));

        assert!(!apply(Control::Shutdown, &handle, &shutdown));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn full_queue_is_not_an_error() {
        let (handle, _rx) = TriggerHandle::channel(1);
        let shutdown = CancellationToken::new();
        assert!(apply(Control::RunNow, &handle, &shutdown));
        assert!(apply(Control::RunNow, &handle, &shutdown));
        assert!(!shutdown.is_cancelled());
    }
}
