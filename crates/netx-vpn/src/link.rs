//! Message channel to the running tunnel process.

use crate::config::TunnelConfig;
use crate::error::TransportError;
use crate::platform::PlatformVpnBoundary;
use crate::protocol::{TunnelCommand, parse_pause_seconds, parse_reply};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Typed wrapper around [`PlatformVpnBoundary::send_message`]
#[derive(Clone)]
pub struct TunnelLink {
    platform: Arc<dyn PlatformVpnBoundary>,
    message_timeout: Duration,
    report_retry_delay: Duration,
}

impl TunnelLink {
    pub fn new(
        platform: Arc<dyn PlatformVpnBoundary>,
        message_timeout: Duration,
        report_retry_delay: Duration,
    ) -> Self {
        Self {
            platform,
            message_timeout,
            report_retry_delay,
        }
    }

    /// Send one command and interpret the reply
    pub async fn send(&self, command: &TunnelCommand) -> Result<String, TransportError> {
        debug!("Tunnel message: {}", command);

        let exchange = self
            .platform
            .send_message(command.encode(), self.message_timeout);
        let reply = timeout(self.message_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;

        parse_reply(&reply).inspect_err(|e| warn!("Tunnel message {} failed: {}", command.name(), e))
    }

    /// Hot-swap the gateway of a running tunnel
    pub async fn connect(&self, config: &TunnelConfig) -> Result<(), TransportError> {
        self.send(&TunnelCommand::connect(config)).await.map(|_| ())
    }

    /// Seconds of pause left.
    ///
    /// Retried once after a delay: right after start the tunnel process may
    /// not answer yet.
    pub async fn report(&self) -> Result<u64, TransportError> {
        let reply = match self.send(&TunnelCommand::Report).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("report failed ({}), retrying in {:?}", e, self.report_retry_delay);
                sleep(self.report_retry_delay).await;
                self.send(&TunnelCommand::Report).await?
            }
        };
        Ok(parse_pause_seconds(&reply))
    }

    /// Pause filtering for `seconds`; `0` unpauses
    pub async fn pause(&self, seconds: u64) -> Result<(), TransportError> {
        self.send(&TunnelCommand::Pause(seconds)).await.map(|_| ())
    }

    /// HTTP request made from inside the tunnel
    pub async fn request(&self, url: &str, method: &str, body: &str) -> Result<String, TransportError> {
        self.send(&TunnelCommand::Request {
            url: url.to_string(),
            method: method.to_string(),
            body: body.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPlatform;

    fn link(platform: &Arc<SimulatedPlatform>) -> TunnelLink {
        TunnelLink::new(
            platform.clone(),
            Duration::from_secs(5),
            Duration::from_secs(3),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_off_when_stopped() {
        let platform = SimulatedPlatform::new();
        assert_eq!(link(&platform).report().await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_retries_once() {
        let platform = SimulatedPlatform::new();
        platform.fail_next_messages(1);

        assert_eq!(link(&platform).report().await, Ok(0));
        assert_eq!(platform.sent_messages(), vec!["report", "report"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_tunnel_times_out() {
        let platform = SimulatedPlatform::new();
        platform.set_message_delay(Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        assert_eq!(link(&platform).pause(10).await, Err(TransportError::Timeout));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protected_request_http_code() {
        let platform = SimulatedPlatform::new();
        platform.reply_with("error: code: 403");

        let result = link(&platform).request("https://api.example.net/v2/lease", "POST", "{}").await;
        assert_eq!(result, Err(TransportError::Code(403)));
    }
}
