//! Supervisor (spec.md §4.8, C8): three independent watchdog layers over
//! the worker pool. Never touches `SystemState` directly — only sends
//! `WorkerCommand`s and reads `last_successful_reading`.

use crate::plugin::worker::{WorkerCommand, WorkerEvent, WorkerHandle};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Connected,
    Initializing,
    Offline,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub watchdog_timeout: Duration,
    pub startup_grace: Duration,
    pub max_plugin_reload_attempts: u32,
    pub stale_data_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(120),
            startup_grace: Duration::from_secs(30),
            max_plugin_reload_attempts: 3,
            stale_data_timeout: Duration::from_secs(900),
        }
    }
}

/// Returned by `tick()` when the escalation threshold is crossed for a
/// worker; the caller (main) is expected to exit with code 2.
pub struct Escalation {
    pub instance_id: String,
}

struct WorkerState {
    consecutive_watchdog_fires: u32,
    availability: Availability,
}

pub struct Supervisor {
    config: SupervisorConfig,
    started_at: Instant,
    handles: HashMap<String, WorkerHandle>,
    states: HashMap<String, WorkerState>,
    event_rx: mpsc::Receiver<WorkerEvent>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, event_rx: mpsc::Receiver<WorkerEvent>) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            handles: HashMap::new(),
            states: HashMap::new(),
            event_rx,
        }
    }

    pub fn register(&mut self, handle: WorkerHandle) {
        self.states.insert(
            handle.instance_id.clone(),
            WorkerState { consecutive_watchdog_fires: 0, availability: Availability::Initializing },
        );
        self.handles.insert(handle.instance_id.clone(), handle);
    }

    pub fn availability(&self, instance_id: &str) -> Availability {
        self.states.get(instance_id).map(|s| s.availability).unwrap_or(Availability::Offline)
    }

    /// Drains any pending `WorkerEvent`s (worker-reported connect-failure
    /// exhaustion) without blocking.
    fn drain_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                WorkerEvent::ConnectFailuresExhausted { instance_id } => {
                    tracing::warn!(instance_id, "worker exhausted connect attempts; issuing reconnect");
                    if let Some(handle) = self.handles.get(&instance_id) {
                        let _ = handle.command_tx.try_send(WorkerCommand::Reconnect);
                    }
                }
            }
        }
    }

    /// One pass of all three watchdog layers. Call on a fixed timer
    /// (spec.md §5: "the supervisor runs on its own timer loop").
    pub fn tick(&mut self, now: Instant) -> Vec<Escalation> {
        self.drain_events();
        let mut escalations = Vec::new();
        let in_grace = now.saturating_duration_since(self.started_at) < self.config.startup_grace;

        let instance_ids: Vec<String> = self.handles.keys().cloned().collect();
        for instance_id in instance_ids {
            // Worker-liveness: recreate is the caller's job (it owns the
            // plugin constructor); we only detect and report here.
            let finished = self.handles.get(&instance_id).map(|h| h.is_finished()).unwrap_or(false);
            if finished {
                tracing::warn!(instance_id = %instance_id, "worker handle terminated unexpectedly");
                continue;
            }

            if in_grace {
                continue;
            }

            let last_ms = self
                .handles
                .get(&instance_id)
                .map(|h| h.last_successful_reading.load(Ordering::Relaxed))
                .unwrap_or(0);

            let stale = last_ms == 0 || now_is_stale(last_ms, self.config.watchdog_timeout);
            let state = self.states.get_mut(&instance_id).unwrap();

            if stale {
                state.consecutive_watchdog_fires += 1;
                tracing::warn!(
                    instance_id = %instance_id,
                    consecutive_fires = state.consecutive_watchdog_fires,
                    "poll-freshness watchdog fired"
                );
                if state.consecutive_watchdog_fires >= self.config.max_plugin_reload_attempts {
                    escalations.push(Escalation { instance_id: instance_id.clone() });
                } else if let Some(handle) = self.handles.get(&instance_id) {
                    let _ = handle.command_tx.try_send(WorkerCommand::Reconnect);
                }
            } else {
                state.consecutive_watchdog_fires = 0;
                state.availability = Availability::Connected;
            }

            if last_ms != 0 && now_is_stale(last_ms, self.config.stale_data_timeout) {
                state.availability = Availability::Offline;
            }
        }

        escalations
    }

    pub async fn shutdown(&self) {
        for handle in self.handles.values() {
            let _ = handle.command_tx.send(WorkerCommand::Shutdown).await;
        }
    }

    /// Sends `Shutdown` to every worker, then waits up to `grace` for all
    /// of them to actually terminate. Returns `true` if every worker
    /// released its transport in time; `false` means the caller must
    /// force-exit (spec.md §5: "every worker MUST release its transport
    /// within `shutdown_grace` seconds or the process force-exits").
    pub async fn shutdown_with_grace(&mut self, grace: Duration) -> bool {
        self.shutdown().await;
        let handles = std::mem::take(&mut self.handles);
        let joins = handles.into_values().map(|h| h.join_handle);
        tokio::time::timeout(grace, futures::future::join_all(joins)).await.is_ok()
    }

    /// spec.md §6 subscriber snapshot schema: `plugin_connection_status`.
    /// A plain, pollable function rather than a push interface, since no
    /// HTTP/dashboard surface is part of the core (SPEC_FULL.md §10.6).
    pub fn health_snapshot(&self) -> HashMap<String, &'static str> {
        self.states
            .iter()
            .map(|(instance_id, state)| {
                let status = match state.availability {
                    Availability::Connected => "connected",
                    Availability::Initializing => "initializing",
                    Availability::Offline => "disconnected",
                };
                (instance_id.clone(), status)
            })
            .collect()
    }
}

fn now_is_stale(last_successful_ms: i64, timeout: Duration) -> bool {
    let now_ms = chrono::Utc::now().timestamp_millis();
    (now_ms - last_successful_ms) as i64 > timeout.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_check_respects_timeout() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        assert!(!now_is_stale(now_ms, Duration::from_secs(120)));
        assert!(now_is_stale(now_ms - 200_000, Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn tick_within_grace_period_never_escalates() {
        let (_tx, rx) = mpsc::channel(8);
        let config = SupervisorConfig { startup_grace: Duration::from_secs(30), ..Default::default() };
        let mut supervisor = Supervisor::new(config, rx);
        let escalations = supervisor.tick(Instant::now());
        assert!(escalations.is_empty());
    }

    #[tokio::test]
    async fn health_snapshot_reflects_registered_workers() {
        let (_tx, rx) = mpsc::channel(8);
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), rx);
        let (command_tx, _command_rx) = mpsc::channel(8);
        let join_handle = tokio::spawn(async { std::future::pending::<()>().await });
        supervisor.register(WorkerHandle {
            instance_id: "solar1".to_string(),
            command_tx,
            last_successful_reading: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0)),
            join_handle,
        });

        let snapshot = supervisor.health_snapshot();
        assert_eq!(snapshot.get("solar1"), Some(&"initializing"));
    }

    #[tokio::test]
    async fn shutdown_with_grace_times_out_on_a_stuck_worker() {
        let (_tx, rx) = mpsc::channel(8);
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), rx);
        let (command_tx, _command_rx) = mpsc::channel(8);
        // This worker never drains its command channel, so it never exits.
        let join_handle = tokio::spawn(async { std::future::pending::<()>().await });
        supervisor.register(WorkerHandle {
            instance_id: "stuck".to_string(),
            command_tx,
            last_successful_reading: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0)),
            join_handle,
        });

        let clean = supervisor.shutdown_with_grace(Duration::from_millis(20)).await;
        assert!(!clean);
    }
}
