use std::{
    io,
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use {tokio::sync::oneshot, tracing::error};

/// Ends the process when graceful shutdown overruns its bound.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Exits the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        std::process::exit(code)
    }
}

/// Exit status used when the force-quit timer fires.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Fires the terminator after `timeout` unless disarmed first. Runs on its
/// own OS thread so a wedged async runtime cannot hold it up.
pub(crate) struct ForceQuitTimer {
    disarm: Option<mpsc::Sender<()>>,
    fired: oneshot::Receiver<()>,
}

impl ForceQuitTimer {
    pub(crate) fn arm(timeout: Duration, terminator: Arc<dyn Terminator>) -> io::Result<Self> {
        let (disarm_tx, disarm_rx) = mpsc::channel::<()>();
        let (fired_tx, fired_rx) = oneshot::channel();
        thread::Builder::new()
            .name("ferry-force-quit".into())
            .spawn(move || {
                // A send or a dropped sender both mean disarmed.
                if let Err(RecvTimeoutError::Timeout) = disarm_rx.recv_timeout(timeout) {
                    error!(timeout = ?timeout, "graceful shutdown timed out, forcing exit");
                    terminator.terminate(FORCED_EXIT_CODE);
                    let _ = fired_tx.send(());
                }
            })?;
        Ok(Self {
            disarm: Some(disarm_tx),
            fired: fired_rx,
        })
    }

    /// Resolves once the timer has fired; never resolves if it was disarmed.
    pub(crate) async fn fired(&mut self) {
        if (&mut self.fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub(crate) fn disarm(mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
    }
}
