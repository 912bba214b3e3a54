//! Application wiring (spec.md §9 "Global state" design note): constructs
//! the aggregator, supervisor, publisher, and one worker per configured
//! plugin instance exactly once at startup, and tears them down last.

use crate::config::schema::AppConfig;
use crate::domain::SystemState;
use crate::error::ConfigError;
use crate::plugin::registry::build_plugin;
use crate::plugin::worker::{self, WorkerConfig};
use crate::publisher::Publisher;
use crate::supervisor::{Supervisor, SupervisorConfig};
use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct App {
    pub config: AppConfig,
    pub publisher: Arc<Publisher>,
    pub supervisor: Supervisor,
    aggregator_task: tokio::task::JoinHandle<SystemState>,
}

impl App {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let timezone = chrono_tz::Tz::from_str(&config.general.local_timezone)
            .map_err(|_| ConfigError::InvalidValue {
                key: "general.local_timezone".to_string(),
                message: format!("not a recognized IANA zone: {}", config.general.local_timezone),
            })
            .context("invalid timezone")?;

        let (reading_tx, reading_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(64);

        let publisher = Arc::new(Publisher::new());
        let mut aggregator = crate::aggregator::Aggregator::new(&config.filter, timezone, reading_rx)
            .with_publisher(publisher.clone());

        #[cfg(feature = "persistence")]
        if config.persistence.enabled {
            let store = crate::persistence::PersistenceStore::connect(
                &config.persistence.db_path,
                config.persistence.history_max_age_hours,
            )
            .await
            .context("opening persistence store")?;
            let (persistence_tx, _writer_task) = crate::persistence::writer::spawn(store);
            aggregator = aggregator.with_persistence(
                persistence_tx,
                Duration::from_secs(config.persistence.snapshot_interval_seconds),
            );
        }

        let aggregator_task = tokio::spawn(aggregator.run());

        let worker_config = WorkerConfig {
            poll_interval: Duration::from_secs(config.general.poll_interval_seconds),
            connect_timeout: Duration::from_secs(10),
            max_consecutive_connect_failures: config.general.max_reconnect_attempts,
            ..WorkerConfig::default()
        };

        let mut supervisor = Supervisor::new(SupervisorConfig::default(), event_rx);

        for instance in &config.instances {
            let plugin = build_plugin(instance).with_context(|| format!("constructing plugin {}", instance.name))?;
            let handle = worker::spawn(
                instance.name.clone(),
                plugin,
                worker_config.clone(),
                reading_tx.clone(),
                event_tx.clone(),
            );
            supervisor.register(handle);
        }
        drop(reading_tx);
        drop(event_tx);

        Ok(Self {
            config,
            publisher,
            supervisor,
            aggregator_task,
        })
    }

    /// Runs the supervisor's timer loop until `shutdown` fires. Returns the
    /// exit code per spec.md §6 (0 clean, 2 supervisor escalation).
    pub async fn run_until_shutdown(&mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> i32 {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let escalations = self.supervisor.tick(std::time::Instant::now());
                    if let Some(escalation) = escalations.into_iter().next() {
                        tracing::error!(instance_id = %escalation.instance_id, "supervisor escalation: exiting");
                        self.supervisor.shutdown().await;
                        return 2;
                    }
                }
                _ = &mut shutdown => {
                    let grace = Duration::from_secs(self.config.general.shutdown_grace_seconds);
                    if !self.supervisor.shutdown_with_grace(grace).await {
                        tracing::error!(?grace, "workers did not release their transports in time; force-exiting");
                        std::process::exit(2);
                    }
                    return 0;
                }
            }
        }
    }

    pub fn aggregator_task(&mut self) -> &mut tokio::task::JoinHandle<SystemState> {
        &mut self.aggregator_task
    }
}
