//! Per-device worker state machine (spec.md §4.3):
//!
//! ```text
//! Init --connect_ok--> ReadStatic --ok--> ReadDynamic --tick--> ReadDynamic
//!   ^                                          |
//!   +---------------- reconnect/err -----------+
//! ```
//!
//! Each worker owns its plugin (and thus its transport) exclusively and
//! publishes `Reading`s through a single channel to the aggregator
//! (spec.md §5). The supervisor only ever talks to a worker through
//! `WorkerCommand` and reads `last_successful_reading`.

use crate::domain::{Reading, StandardKey, Value};
use crate::plugin::Plugin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default for `WorkerConfig::max_consecutive_waiting_polls` (spec.md
/// §4.3's `ReadDynamic→Reconnect` trigger); not one of §6's required
/// config keys, so it isn't exposed as a per-instance setting.
const DEFAULT_MAX_CONSECUTIVE_WAITING_POLLS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub enum WorkerCommand {
    /// Disconnect (if connected) and restart from `Init`.
    Reconnect,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker has exhausted `max_consecutive_connect_failures` and is
    /// now parked waiting for a supervisor command (spec.md §4.3).
    ConnectFailuresExhausted { instance_id: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub max_consecutive_connect_failures: u32,
    pub max_consecutive_waiting_polls: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_consecutive_connect_failures: 5,
            max_consecutive_waiting_polls: DEFAULT_MAX_CONSECUTIVE_WAITING_POLLS,
        }
    }
}

pub struct WorkerHandle {
    pub instance_id: String,
    pub command_tx: mpsc::Sender<WorkerCommand>,
    /// Unix millis of the last successful `read_dynamic`; `0` if none yet.
    pub last_successful_reading: Arc<AtomicI64>,
    pub join_handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

enum State {
    Init,
    ReadStatic,
    ReadDynamic,
}

pub fn spawn(
    instance_id: String,
    plugin: Box<dyn Plugin>,
    config: WorkerConfig,
    reading_tx: mpsc::Sender<Reading>,
    event_tx: mpsc::Sender<WorkerEvent>,
) -> WorkerHandle {
    let (command_tx, command_rx) = mpsc::channel(8);
    let last_successful_reading = Arc::new(AtomicI64::new(0));
    let last_successful_reading_for_task = last_successful_reading.clone();
    let instance_id_for_task = instance_id.clone();

    let join_handle = tokio::spawn(async move {
        run(
            instance_id_for_task,
            plugin,
            config,
            reading_tx,
            event_tx,
            command_rx,
            last_successful_reading_for_task,
        )
        .await;
    });

    WorkerHandle {
        instance_id,
        command_tx,
        last_successful_reading,
        join_handle,
    }
}

async fn run(
    instance_id: String,
    mut plugin: Box<dyn Plugin>,
    config: WorkerConfig,
    reading_tx: mpsc::Sender<Reading>,
    event_tx: mpsc::Sender<WorkerEvent>,
    mut command_rx: mpsc::Receiver<WorkerCommand>,
    last_successful_reading: Arc<AtomicI64>,
) {
    let mut state = State::Init;
    let mut consecutive_connect_failures = 0u32;
    let mut consecutive_waiting_polls = 0u32;

    loop {
        if let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Reconnect => {
                    plugin.disconnect().await;
                    state = State::Init;
                    consecutive_connect_failures = 0;
                    consecutive_waiting_polls = 0;
                }
            }
        }

        state = match state {
            State::Init => {
                match plugin.connect(config.connect_timeout).await {
                    Ok(true) => {
                        consecutive_connect_failures = 0;
                        State::ReadStatic
                    }
                    _ => {
                        consecutive_connect_failures += 1;
                        if consecutive_connect_failures >= config.max_consecutive_connect_failures {
                            let _ = event_tx
                                .send(WorkerEvent::ConnectFailuresExhausted {
                                    instance_id: instance_id.clone(),
                                })
                                .await;
                            match command_rx.recv().await {
                                Some(WorkerCommand::Reconnect) => {
                                    consecutive_connect_failures = 0;
                                }
                                Some(WorkerCommand::Shutdown) | None => break,
                            }
                        } else {
                            tokio::time::sleep(backoff_for(consecutive_connect_failures)).await;
                        }
                        State::Init
                    }
                }
            }
            State::ReadStatic => match plugin.read_static().await {
                Ok(reading) => {
                    if reading_tx.send(reading).await.is_err() {
                        break;
                    }
                    State::ReadDynamic
                }
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, error = %e, "static read failed");
                    plugin.disconnect().await;
                    State::Init
                }
            },
            State::ReadDynamic => {
                let cycle_start = Instant::now();
                match plugin.read_dynamic().await {
                    Ok(reading) => {
                        last_successful_reading.store(now_millis(), Ordering::Relaxed);
                        let is_waiting = matches!(
                            reading.values.get(&StandardKey::OperationalInverterStatusText),
                            Some(Value::Text(s)) if s == "initializing" || s == "waiting"
                        );
                        if reading_tx.send(reading).await.is_err() {
                            break;
                        }
                        if is_waiting {
                            consecutive_waiting_polls += 1;
                            if consecutive_waiting_polls >= config.max_consecutive_waiting_polls {
                                tracing::warn!(
                                    instance_id = %instance_id,
                                    consecutive_waiting_polls,
                                    "device reported initializing/waiting status too many times in a row; reconnecting"
                                );
                                plugin.disconnect().await;
                                state = State::Init;
                                consecutive_waiting_polls = 0;
                                continue;
                            }
                        } else {
                            consecutive_waiting_polls = 0;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %instance_id, error = %e, "dynamic read failed");
                        plugin.disconnect().await;
                        state = State::Init;
                        consecutive_waiting_polls = 0;
                        continue;
                    }
                }

                let elapsed = cycle_start.elapsed();
                if elapsed < config.poll_interval {
                    let remaining = config.poll_interval - elapsed;
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        cmd = command_rx.recv() => match cmd {
                            Some(WorkerCommand::Shutdown) | None => break,
                            Some(WorkerCommand::Reconnect) => {
                                plugin.disconnect().await;
                                state = State::Init;
                                consecutive_connect_failures = 0;
                                consecutive_waiting_polls = 0;
                                continue;
                            }
                        },
                    }
                } else {
                    tracing::warn!(instance_id = %instance_id, elapsed = ?elapsed, poll_interval = ?config.poll_interval, "poll cycle ran long; skipping sleep");
                }
                State::ReadDynamic
            }
        };
    }

    plugin.disconnect().await;
}

/// `Init→Backoff` schedule, exponential, capped at 60s (spec.md §4.3).
fn backoff_for(consecutive_failures: u32) -> Duration {
    let secs = 2u64.saturating_pow(consecutive_failures).min(60);
    Duration::from_secs(secs)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{DeviceCategory, ParamDescriptor, Plugin};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Always reports an "initializing" dynamic reading, and counts how
    /// many times `connect` is called so the test can observe a forced
    /// reconnect.
    struct AlwaysWaitingPlugin {
        connect_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Plugin for AlwaysWaitingPlugin {
        fn name(&self) -> &str {
            "fake"
        }
        fn pretty_name(&self) -> &str {
            "fake"
        }
        fn category(&self) -> DeviceCategory {
            DeviceCategory::Inverter
        }
        async fn connect(&mut self, _deadline: Duration) -> Result<bool, crate::error::PluginError> {
            self.connect_calls.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
        async fn disconnect(&mut self) {}
        async fn read_static(&mut self) -> Result<Reading, crate::error::PluginError> {
            Ok(Reading::new("fake"))
        }
        async fn read_dynamic(&mut self) -> Result<Reading, crate::error::PluginError> {
            let mut reading = Reading::new("fake");
            reading
                .values
                .insert(StandardKey::OperationalInverterStatusText, Value::Text("waiting".to_string()));
            Ok(reading)
        }
        fn configurable_params(&self) -> Vec<ParamDescriptor> {
            vec![]
        }
    }

    #[tokio::test]
    async fn reconnects_after_max_consecutive_waiting_polls() {
        let connect_calls = Arc::new(AtomicU32::new(0));
        let plugin = Box::new(AlwaysWaitingPlugin { connect_calls: connect_calls.clone() });
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(1),
            max_consecutive_waiting_polls: 3,
            ..WorkerConfig::default()
        };
        let (reading_tx, mut reading_rx) = mpsc::channel(64);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);

        let handle = tokio::spawn(run(
            "fake".to_string(),
            plugin,
            config,
            reading_tx,
            event_tx,
            command_rx,
            Arc::new(AtomicI64::new(0)),
        ));

        // One static reading plus enough dynamic readings to cross the
        // waiting-poll threshold at least once.
        for _ in 0..5 {
            reading_rx.recv().await.unwrap();
        }

        let _ = command_tx.send(WorkerCommand::Shutdown).await;
        handle.await.unwrap();

        assert!(connect_calls.load(Ordering::Relaxed) >= 2, "expected at least one forced reconnect");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(3), Duration::from_secs(8));
        assert_eq!(backoff_for(10), Duration::from_secs(60));
    }
}
