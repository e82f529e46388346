//! Optional retry layer over [`Dispatcher::send_now`].
//!
//! The dispatcher itself never retries. Wrapping it in [`Retrying`] spends a
//! command's `retries` budget on transport failures only: a timeout or an
//! offline device is pinged back to life and retried after a linear backoff.
//! Device-reported errors and invalid commands are returned immediately.

use std::time::Duration;

use tracing::info;

use super::command::Command;
use super::command::CommandOutcome;
use super::command::CommandStatus;
use super::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct Retrying {
    dispatcher: Dispatcher,
    backoff: Duration,
}

impl Retrying {
    pub fn new(dispatcher: Dispatcher, backoff: Duration) -> Self {
        Self {
            dispatcher,
            backoff,
        }
    }

    /// Like `send_now`, returning the last attempt's outcome
    pub async fn send_now(&self, device_id: &str, command: Command) -> CommandOutcome {
        let mut attempt = 1;
        loop {
            let outcome = self.dispatcher.send_now(device_id, command.clone()).await;
            if !is_retryable(&outcome) || attempt > command.retries {
                return outcome;
            }
            info!(
                "Retrying {} on {} ({}/{}) after {}",
                outcome.command, device_id, attempt, command.retries, outcome.status
            );
            tokio::time::sleep(self.backoff * attempt).await;
            // A failed revive leaves the device offline; the next attempt is
            // refused quickly and still consumes budget.
            let _ = self.dispatcher.revive(device_id).await;
            attempt += 1;
        }
    }
}

fn is_retryable(outcome: &CommandOutcome) -> bool {
    matches!(
        outcome.status,
        CommandStatus::Timeout | CommandStatus::DeviceOffline
    )
}
