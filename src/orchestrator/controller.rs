//! Run lifecycle controller.
//!
//! Owns the engine task, turns UI commands and termination signals into
//! engine control messages, and emits events for presentation layers.

use crate::engine::worker::signal_group;
use crate::engine::{shutdown_signal, EngineControl, ScanEngine};
use crate::error::RunError;
use crate::model::{InfoEvent, RunConfig, RunEvent, RunReport, TaskState};
use crate::storage::RunLayout;
use crate::store::TaskStore;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Commands emitted by UI layers to control the running scan.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Pause(bool),
    Quit,
}

/// Run the scan to completion, honouring UI commands and SIGINT/SIGTERM.
///
/// Sends `RunEvent::RunCompleted` before returning the report.
pub(crate) async fn run_controller(
    cfg: RunConfig,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<RunReport> {
    let grace = cfg.grace_period;
    let status_dir = RunLayout::new(&cfg.output_dir).status_dir();
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<EngineControl>();
    let engine = ScanEngine::new(cfg);
    let engine_events = event_tx.clone();
    let mut handle = tokio::spawn(async move { engine.run(engine_events, ctrl_rx).await });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut commands_open = true;
    let mut cancel_requested = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<Instant> = None;

    let request_cancel = |why: &str, cancel_requested: &mut bool| {
        if *cancel_requested {
            return None;
        }
        *cancel_requested = true;
        info!("{why}; cancelling run");
        let _ = ctrl_tx.send(EngineControl::Cancel);
        let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
            "{why}: cancelling…"
        ))));
        Some(Instant::now() + grace + Duration::from_secs(3))
    };

    let joined = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(UiCommand::Pause(p)) => {
                        let _ = ctrl_tx.send(EngineControl::Pause(p));
                    }
                    Some(UiCommand::Quit) if cancel_requested => {
                        force_stop(&status_dir, &event_tx);
                    }
                    Some(UiCommand::Quit) => {
                        if let Some(d) = request_cancel("Quit requested", &mut cancel_requested) {
                            cancel_deadline = Some(d);
                        }
                    }
                    None => {
                        commands_open = false;
                        if let Some(d) = request_cancel("Dashboard closed", &mut cancel_requested) {
                            cancel_deadline = Some(d);
                        }
                    }
                }
            }
            _ = &mut shutdown => {
                // Re-arm so a second signal during the grace period is seen.
                shutdown.set(shutdown_signal());
                if cancel_requested {
                    force_stop(&status_dir, &event_tx);
                } else if let Some(d) = request_cancel("Termination signal", &mut cancel_requested) {
                    cancel_deadline = Some(d);
                }
            }
            joined = &mut handle => break joined,
            // If cancel stalls (an engine ignoring SIGTERM), keep the user informed.
            _ = async {
                match cancel_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            } => {
                warn!("cancellation is taking longer than the grace period");
                let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(
                    "Still cancelling…".into(),
                )));
                cancel_deadline = None;
            }
        }
    };

    match joined.context("scan engine task failed")? {
        Ok(report) => {
            let _ = event_tx.send(RunEvent::RunCompleted {
                report: Box::new(report.clone()),
            });
            Ok(report)
        }
        Err(e) => {
            if e.downcast_ref::<RunError>().is_some_and(RunError::is_fatal) {
                error!("run aborted before scheduling: {e:#}");
            }
            let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
                "Run failed: {e:#}"
            ))));
            Err(e)
        }
    }
}

/// Second stop request: SIGKILL every in-flight engine without waiting out the grace period.
///
/// Workers see their invocation exit and finish normally, so the report is still written.
fn force_stop(status_dir: &Path, event_tx: &UnboundedSender<RunEvent>) {
    let store = match TaskStore::open(status_dir) {
        Ok(store) => store,
        Err(e) => {
            warn!("cannot open task store to force-stop: {e}");
            return;
        }
    };
    let mut killed = 0;
    for rec in store.read_all() {
        if rec.state == TaskState::Processing && rec.pid.is_some() {
            signal_group(rec.pid, true);
            killed += 1;
        }
    }
    warn!(killed, "second stop request; killing in-flight invocations");
    let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
        "Killed {killed} in-flight invocation(s)"
    ))));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::worker::tests::stub_config;

    #[tokio::test]
    async fn quit_cancels_and_still_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = stub_config(tmp.path(), "sleep 30");
        cfg.output_dir = tmp.path().join("out");
        cfg.concurrency = 1;
        std::fs::write(&cfg.source, "a\nb\nc\n").unwrap();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cmd_tx.send(UiCommand::Quit);
            // Keep the command channel open until the run is over.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let report = run_controller(cfg, event_tx, cmd_rx).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processing, 0);

        let mut completed_event = false;
        while let Ok(ev) = event_rx.try_recv() {
            if matches!(ev, RunEvent::RunCompleted { .. }) {
                completed_event = true;
            }
        }
        assert!(completed_event);
    }

    #[tokio::test]
    async fn second_quit_kills_engines_ignoring_sigterm() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = stub_config(tmp.path(), "trap '' TERM; sleep 30");
        cfg.output_dir = tmp.path().join("out");
        cfg.concurrency = 1;
        cfg.grace_period = Duration::from_secs(20);
        std::fs::write(&cfg.source, "a\nb\n").unwrap();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cmd_tx.send(UiCommand::Quit);
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cmd_tx.send(UiCommand::Quit);
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        // Well inside the 20s grace period.
        let report = tokio::time::timeout(
            Duration::from_secs(8),
            run_controller(cfg, event_tx, cmd_rx),
        )
        .await
        .expect("second quit should not wait out the grace period")
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processing, 0);
        assert_eq!(report.completed, 0);

        let mut killed_message = false;
        while let Ok(ev) = event_rx.try_recv() {
            if let RunEvent::Info(InfoEvent::Message(m)) = ev {
                killed_message |= m.starts_with("Killed 1 in-flight");
            }
        }
        assert!(killed_message);
    }
}
