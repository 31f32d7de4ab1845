//! Scheduler daemon
//!
//! Runs the batch orchestrator for every tenant on a fixed interval, and on
//! demand through [`SyncCommand`]s. Tenants are processed concurrently.

use super::metrics;
use super::orchestrator::{BatchOrchestrator, BatchReport};
use super::session::TenantSession;
use crate::{Result, SyncError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Event broadcast channel capacity
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Stopped,
    /// A batch finished for one tenant
    BatchCompleted(BatchReport),
    Error { message: String },
}

/// Commands accepted by a running daemon
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Run now, for one tenant or all of them
    SyncNow(Option<String>),
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

pub struct SyncDaemon {
    sessions: Vec<Arc<TenantSession>>,
    orchestrator: BatchOrchestrator,
    poll_interval: Duration,
    event_tx: broadcast::Sender<SyncEvent>,
    command_tx: mpsc::Sender<SyncCommand>,
    command_rx: Option<mpsc::Receiver<SyncCommand>>,
}

impl SyncDaemon {
    pub fn new(
        sessions: Vec<Arc<TenantSession>>,
        orchestrator: BatchOrchestrator,
        poll_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            sessions,
            orchestrator,
            poll_interval,
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<SyncCommand> {
        self.command_tx.clone()
    }

    fn send_event(&self, event: SyncEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("Event sent but no receivers subscribed");
        }
    }

    /// Run until a `Shutdown` command or Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| SyncError::Config("Daemon already running".to_string()))?;

        metrics::set_health_status(true);
        self.send_event(SyncEvent::Started);
        tracing::info!(
            tenants = self.sessions.len(),
            interval_secs = self.poll_interval.as_secs(),
            "Sync daemon started"
        );

        // tokio panics on a zero period
        let mut interval = tokio::time::interval(self.poll_interval.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sync_tenants(None).await;
                }
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    match self.handle_command(cmd).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C, shutting down");
                    break;
                }
            }
        }

        metrics::set_health_status(false);
        self.send_event(SyncEvent::Stopped);
        tracing::info!("Sync daemon stopped");
        Ok(())
    }

    async fn handle_command(&self, cmd: SyncCommand) -> CommandResult {
        match cmd {
            SyncCommand::SyncNow(tenant) => {
                if let Some(ref id) = tenant {
                    if !self.sessions.iter().any(|s| s.tenant_id() == id) {
                        self.send_event(SyncEvent::Error {
                            message: format!("Unknown tenant: {}", id),
                        });
                        return CommandResult::Continue;
                    }
                }
                self.sync_tenants(tenant.as_deref()).await;
                CommandResult::Continue
            }
            SyncCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                CommandResult::Stop
            }
        }
    }

    /// Run one batch per selected tenant, concurrently
    pub async fn sync_tenants(&self, tenant: Option<&str>) -> Vec<BatchReport> {
        let selected: Vec<Arc<TenantSession>> = self
            .sessions
            .iter()
            .filter(|s| tenant.map_or(true, |id| s.tenant_id() == id))
            .cloned()
            .collect();

        let reports = self.orchestrator.run_tenants(&selected).await;
        for report in &reports {
            self.send_event(SyncEvent::BatchCompleted(report.clone()));
        }
        reports
    }
}
