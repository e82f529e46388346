//! Command execution against devices.
//!
//! Each device has an async lock held for the whole of a command's network
//! round trip, so at most one command is in flight per device. Queued work
//! additionally waits for a permit from a global worker pool; when the pool
//! is saturated tickets simply wait in the channel.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::client::DeviceClient;
use super::client::TransportError;
use super::command::Command;
use super::command::CommandKind;
use super::command::CommandOutcome;
use super::command::CommandStatus;
use super::device::Device;
use super::device::DeviceStatus;
use super::registry::Registry;
use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::error::Result;

/// Aggregate command statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Refused before any network call
    pub commands_refused: u64,
    /// Percent
    pub success_rate: f64,
    /// Mean over all sent commands, seconds
    pub avg_response_time: f64,
    pub broadcasts: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyStopReport {
    pub queued_cleared: usize,
    pub targeted: usize,
    pub acknowledged: usize,
    pub results: Vec<CommandOutcome>,
}

#[derive(Debug, Default)]
struct Totals {
    sent: u64,
    succeeded: u64,
    failed: u64,
    refused: u64,
    response_time_sum: f64,
    broadcasts: u64,
}

struct Inner {
    registry: Arc<Registry>,
    client: Arc<dyn DeviceClient>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    work_tx: mpsc::UnboundedSender<String>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    totals: Mutex<Totals>,
}

/// Cheap to clone; clones share queues and statistics
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn DeviceClient>,
        config: DispatcherConfig,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                registry,
                client,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                device_locks: Mutex::new(HashMap::new()),
                work_tx,
                work_rx: Mutex::new(Some(work_rx)),
                totals: Mutex::new(Totals::default()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// A command carrying the configured default timeout, retries and priority
    pub fn command(&self, kind: CommandKind) -> Command {
        let config = &self.inner.config;
        Command {
            timeout_ms: config.command_timeout_ms,
            retries: config.command_retries,
            priority: config.command_priority,
            ..Command::new(kind)
        }
    }

    fn totals(&self) -> std::sync::MutexGuard<'_, Totals> {
        self.inner
            .totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Execute `command` against one device now, waiting for any command
    /// already in flight on that device.
    pub async fn send_now(&self, device_id: &str, command: Command) -> CommandOutcome {
        if let Err(e) = command.validate() {
            return self.refuse(device_id, &command, CommandStatus::InvalidCommand, e.to_string());
        }
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;
        self.execute(device_id, &command).await
    }

    /// [`Dispatcher::send_now`], with any failure mapped onto [`Error`]
    pub async fn send(&self, device_id: &str, command: Command) -> Result<CommandOutcome> {
        self.send_now(device_id, command).await.into_result()
    }

    /// Append to the device's queue; the background loop executes it later.
    ///
    /// Returns the device's queue length after insertion.
    pub fn enqueue(&self, device_id: &str, command: Command) -> Result<usize> {
        command.validate()?;
        let verb = command.verb();
        let len = self.inner.registry.push_command(device_id, command)?;
        if self.inner.work_tx.send(device_id.to_string()).is_err() {
            warn!("Dispatcher work queue closed; {} stays queued", verb);
        }
        debug!("Queued {} for {} (queue length {})", verb, device_id, len);
        Ok(len)
    }

    /// Drain the global work queue until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let rx = self
            .inner
            .work_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            error!("Dispatcher queue loop already running");
            return;
        };
        info!("Dispatcher queue loop started");
        loop {
            let device_id = tokio::select! {
                _ = cancel.cancelled() => break,
                ticket = rx.recv() => match ticket {
                    Some(device_id) => device_id,
                    None => break,
                },
            };
            let this = self.clone();
            tokio::spawn(async move { this.drain_one(&device_id).await });
        }
        info!("Dispatcher queue loop stopped");
    }

    async fn drain_one(&self, device_id: &str) {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;
        let Ok(_permit) = self.inner.workers.clone().acquire_owned().await else {
            return;
        };
        let Some(command) = self.inner.registry.pop_command(device_id) else {
            return;
        };
        let outcome = self.execute(device_id, &command).await;
        debug!(
            "Queued {} on {} finished: {}",
            outcome.command, device_id, outcome.status
        );
    }

    /// Run one command. The caller holds the device lock.
    async fn execute(&self, device_id: &str, command: &Command) -> CommandOutcome {
        let registry = &self.inner.registry;
        let Some(device) = registry.get(device_id) else {
            return self.refuse(device_id, command, CommandStatus::NotFound, "device not found");
        };
        if !device.is_responsive() {
            return self.refuse(
                device_id,
                command,
                CommandStatus::DeviceOffline,
                format!("device not responsive (status {})", device.status),
            );
        }

        let verb = command.verb();
        let _ = registry.set_status(device_id, DeviceStatus::Busy, format!("executing {}", verb));
        let start = Instant::now();
        let result = self
            .inner
            .client
            .send_command(&device.address, &command.kind, command.timeout())
            .await;
        let response_time = start.elapsed().as_secs_f64();

        let mut outcome = CommandOutcome {
            device_id: device_id.to_string(),
            command: verb.to_string(),
            status: CommandStatus::Success,
            message: String::new(),
            data: None,
            response_time,
            http_status: None,
            code: None,
        };
        let (status, reason) = match result {
            Ok(reply) => {
                outcome.message = reply.message;
                outcome.data = reply.data;
                outcome.http_status = Some(200);
                (DeviceStatus::Online, format!("{} ok", verb))
            }
            Err(TransportError::Status { code, body }) => {
                outcome.status = CommandStatus::Failed;
                outcome.http_status = Some(code);
                outcome.message = format!("HTTP {}: {}", code, body);
                (DeviceStatus::Error, outcome.message.clone())
            }
            Err(TransportError::Timeout) => {
                outcome.status = CommandStatus::Timeout;
                outcome.message = format!("no response within {}ms", command.timeout_ms);
                (DeviceStatus::Offline, "timeout".to_string())
            }
            Err(TransportError::Unreachable(e)) => {
                outcome.status = CommandStatus::DeviceOffline;
                outcome.message = e;
                (DeviceStatus::Offline, "unreachable".to_string())
            }
            Err(e) => {
                outcome.status = CommandStatus::Failed;
                outcome.message = e.to_string();
                (DeviceStatus::Error, e.to_string())
            }
        };

        let outcome = outcome.with_code();
        let success = outcome.is_success();
        let last_response = outcome.message.clone();
        let _ = registry.update(device_id, |d| {
            d.set_status(status, reason);
            d.record_command_result(success, response_time);
            d.last_command = Some(verb.to_string());
            d.last_response = Some(last_response);
        });

        {
            let mut totals = self.totals();
            totals.sent += 1;
            totals.response_time_sum += response_time;
            if success {
                totals.succeeded += 1;
            } else {
                totals.failed += 1;
            }
        }

        if success {
            debug!("{} on {} succeeded in {:.3}s", verb, device_id, response_time);
        } else {
            warn!(
                "{} on {} failed ({}): {}",
                verb, device_id, outcome.status, outcome.message
            );
        }
        outcome
    }

    fn refuse(
        &self,
        device_id: &str,
        command: &Command,
        status: CommandStatus,
        message: impl Into<String>,
    ) -> CommandOutcome {
        let outcome = CommandOutcome::refused(device_id, command, status, message);
        debug!(
            "Refused {} for {}: {}",
            outcome.command, device_id, outcome.message
        );
        self.totals().refused += 1;
        outcome
    }

    /// Send `command` to every Online (or Busy) device matching `filter`, in
    /// parallel.
    ///
    /// Returns one outcome per targeted device in completion order. Devices
    /// still running when the collective timeout expires are reported as
    /// `Timeout`; their calls are left to finish in the background.
    pub async fn broadcast(
        &self,
        command: Command,
        filter: impl Fn(&Device) -> bool,
    ) -> Vec<CommandOutcome> {
        let targets: Vec<String> = self
            .inner
            .registry
            .list()
            .into_iter()
            .filter(|d| d.is_responsive() && filter(d))
            .map(|d| d.device_id().to_string())
            .collect();
        self.totals().broadcasts += 1;
        info!("Broadcasting {} to {} devices", command.verb(), targets.len());

        let mut tasks = JoinSet::new();
        for device_id in &targets {
            let this = self.clone();
            let device_id = device_id.clone();
            let command = command.clone();
            tasks.spawn(async move { this.send_now(&device_id, command).await });
        }

        let mut results = Vec::with_capacity(targets.len());
        let deadline = tokio::time::sleep(self.inner.config.broadcast_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => results.push(outcome),
                    Some(Err(e)) => error!("Broadcast task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("Broadcast of {} hit its deadline", command.verb());
                    break;
                }
            }
        }
        tasks.detach_all();

        let answered: HashSet<String> = results.iter().map(|o| o.device_id.clone()).collect();
        for device_id in targets.iter().filter(|id| !answered.contains(*id)) {
            results.push(CommandOutcome::refused(
                device_id,
                &command,
                CommandStatus::Timeout,
                "broadcast deadline exceeded",
            ));
        }
        results
    }

    /// Clear every queue, then broadcast an immediate stop
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        let queued_cleared = self.inner.registry.clear_all_queues();
        warn!("EMERGENCY STOP: cleared {} queued commands", queued_cleared);
        let command = self
            .command(CommandKind::EmergencyStop { immediate: true })
            .with_priority(crate::fleet::command::MAX_PRIORITY);
        let results = self.broadcast(command, |_| true).await;
        let acknowledged = results.iter().filter(|o| o.is_success()).count();
        warn!(
            "EMERGENCY STOP acknowledged by {}/{} devices",
            acknowledged,
            results.len()
        );
        EmergencyStopReport {
            queued_cleared,
            targeted: results.len(),
            acknowledged,
            results,
        }
    }

    pub fn clear_device_queue(&self, device_id: &str) -> Result<usize> {
        self.inner.registry.clear_queue(device_id)
    }

    /// Ping a device and mark it Online if it answers
    pub async fn revive(&self, device_id: &str) -> Result<bool> {
        let device = self
            .inner
            .registry
            .get(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;
        let timeout = std::time::Duration::from_millis(self.inner.config.command_timeout_ms);
        match self.inner.client.ping(&device.address, timeout).await {
            Ok(()) => {
                self.inner
                    .registry
                    .set_status(device_id, DeviceStatus::Online, "ping ok")?;
                Ok(true)
            }
            Err(e) => {
                debug!("Revive ping to {} failed: {}", device_id, e);
                Ok(false)
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let queued = self
            .inner
            .registry
            .list()
            .iter()
            .map(Device::queue_length)
            .sum();
        let totals = self.totals();
        let (success_rate, avg_response_time) = if totals.sent == 0 {
            (0.0, 0.0)
        } else {
            (
                totals.succeeded as f64 / totals.sent as f64 * 100.0,
                totals.response_time_sum / totals.sent as f64,
            )
        };
        DispatchStats {
            commands_sent: totals.sent,
            commands_succeeded: totals.succeeded,
            commands_failed: totals.failed,
            commands_refused: totals.refused,
            success_rate,
            avg_response_time,
            broadcasts: totals.broadcasts,
            queued,
        }
    }
}
