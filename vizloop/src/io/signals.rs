//! Turns SIGINT/SIGTERM into a [`CancelToken`] so a run can wind down.
//!
//! The first signal only sets the token: child process waits notice it, kill
//! their process group and the workspace is removed on the normal path. A
//! second signal exits immediately.

use std::sync::mpsc::{self, Sender};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::cancel::CancelToken;
use crate::exit_codes;

/// Install the signal listener on a background thread.
///
/// Returns once the handlers are registered, so a signal arriving after this
/// call never takes the default (terminate) action.
pub fn cancel_on_signal(cancel: &CancelToken) -> Result<()> {
    let cancel = cancel.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    thread::Builder::new()
        .name("vizloop-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!(e).context("build signal runtime")));
                    return;
                }
            };
            runtime.block_on(listen(cancel, ready_tx));
        })
        .context("spawn signal listener")?;

    ready_rx
        .recv()
        .context("signal listener stopped before registering")?
}

#[cfg(unix)]
async fn listen(cancel: CancelToken, ready: Sender<Result<()>>) {
    use tokio::signal::unix::{SignalKind, signal};

    let registered = signal(SignalKind::interrupt())
        .and_then(|sigint| Ok((sigint, signal(SignalKind::terminate())?)));
    let (mut sigint, mut sigterm) = match registered {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(anyhow!(e).context("register signal handlers")));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("signal handlers registered");

    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        on_signal(&cancel, name);
    }
}

#[cfg(not(unix))]
async fn listen(cancel: CancelToken, ready: Sender<Result<()>>) {
    let _ = ready.send(Ok(()));
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(err = %e, "ctrl-c listener failed");
            return;
        }
        on_signal(&cancel, "ctrl-c");
    }
}

fn on_signal(cancel: &CancelToken, name: &str) {
    if cancel.is_cancelled() {
        warn!(signal = name, "second signal, exiting without cleanup");
        std::process::exit(exit_codes::CANCELLED);
    }
    warn!(signal = name, "signal received, stopping (repeat to force)");
    cancel.cancel();
}
