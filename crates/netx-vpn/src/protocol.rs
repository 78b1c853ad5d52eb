//! Tunnel process message protocol.
//!
//! Commands are space separated strings; the first word names the command.
//! Replies are plain strings. An `error: code: N` or `error: ...` prefix
//! signals failure, anything else is the success payload.

use crate::config::TunnelConfig;
use crate::error::TransportError;
use std::fmt;

const ERROR_CODE_PREFIX: &str = "error: code: ";
const ERROR_PREFIX: &str = "error: ";
const BODY_SEPARATOR: &str = " :body: ";

/// `report` reply while the tunnel process is stopped
pub const REPORT_OFF: &str = "off";

/// Message sent to the running tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCommand {
    /// Hot-swap the gateway configuration
    Connect {
        private_key: String,
        gateway_public_key: String,
        ipv4: String,
        ipv6: String,
        port: u16,
        vip4: String,
        vip6: String,
        dns: String,
    },
    /// Ask for the pause state
    Report,
    /// Pause filtering for this many seconds; `0` unpauses
    Pause(u64),
    Disconnect,
    /// HTTP request made from inside the tunnel
    Request {
        url: String,
        method: String,
        body: String,
    },
}

impl TunnelCommand {
    pub fn connect(config: &TunnelConfig) -> Self {
        TunnelCommand::Connect {
            private_key: config.private_key.to_base64(),
            gateway_public_key: config.gateway.public_key.to_base64(),
            ipv4: config.gateway.ipv4.to_string(),
            ipv6: config.gateway.ipv6.to_string(),
            port: config.gateway.port,
            vip4: config.lease.vip4.to_string(),
            vip6: config.lease.vip6.to_string(),
            dns: config.dns(),
        }
    }

    /// First word of the encoded command
    pub fn name(&self) -> &'static str {
        match self {
            TunnelCommand::Connect { .. } => "connect",
            TunnelCommand::Report => "report",
            TunnelCommand::Pause(_) => "pause",
            TunnelCommand::Disconnect => "disconnect",
            TunnelCommand::Request { .. } => "request",
        }
    }

    /// Wire form
    pub fn encode(&self) -> String {
        match self {
            TunnelCommand::Connect {
                private_key,
                gateway_public_key,
                ipv4,
                ipv6,
                port,
                vip4,
                vip6,
                dns,
            } => format!(
                "connect {} {} {} {} {} {} {} {}",
                private_key, gateway_public_key, ipv4, ipv6, port, vip4, vip6, dns
            ),
            TunnelCommand::Report => "report".to_string(),
            TunnelCommand::Pause(seconds) => format!("pause {}", seconds),
            TunnelCommand::Disconnect => "disconnect".to_string(),
            TunnelCommand::Request { url, method, body } => {
                format!("request {} {}{}{}", url, method, BODY_SEPARATOR, body)
            }
        }
    }

    /// Parse the wire form (the tunnel process side)
    pub fn decode(message: &str) -> Option<Self> {
        let (head, body) = match message.split_once(BODY_SEPARATOR) {
            Some((head, body)) => (head, Some(body)),
            None => (message, None),
        };
        let params: Vec<&str> = head.split(' ').collect();

        match params.as_slice() {
            ["connect", private_key, gateway, ipv4, ipv6, port, vip4, vip6, dns] => {
                Some(TunnelCommand::Connect {
                    private_key: private_key.to_string(),
                    gateway_public_key: gateway.to_string(),
                    ipv4: ipv4.to_string(),
                    ipv6: ipv6.to_string(),
                    port: port.parse().ok()?,
                    vip4: vip4.to_string(),
                    vip6: vip6.to_string(),
                    dns: dns.to_string(),
                })
            }
            ["report"] => Some(TunnelCommand::Report),
            ["pause", seconds] => Some(TunnelCommand::Pause(seconds.parse().unwrap_or(0))),
            ["disconnect"] => Some(TunnelCommand::Disconnect),
            ["request", url, method] => Some(TunnelCommand::Request {
                url: url.to_string(),
                method: method.to_string(),
                body: body.unwrap_or_default().to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelCommand {
    /// Log form; never includes the private key or a request body
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelCommand::Connect { gateway_public_key, dns, .. } => {
                write!(f, "connect [redacted] {} dns={}", gateway_public_key, dns)
            }
            TunnelCommand::Request { url, method, .. } => write!(f, "request {} {}", method, url),
            other => write!(f, "{}", other.encode()),
        }
    }
}

/// Interpret a reply from the tunnel process
pub fn parse_reply(reply: &str) -> Result<String, TransportError> {
    if let Some(code) = reply.strip_prefix(ERROR_CODE_PREFIX) {
        let code = code
            .trim()
            .parse()
            .map_err(|_| TransportError::Remote(reply.to_string()))?;
        return Err(TransportError::Code(code));
    }
    if let Some(message) = reply.strip_prefix(ERROR_PREFIX) {
        return Err(TransportError::Remote(message.to_string()));
    }
    Ok(reply.to_string())
}

/// Seconds of pause left according to a `report` reply
pub fn parse_pause_seconds(reply: &str) -> u64 {
    if reply == REPORT_OFF {
        0
    } else {
        reply.trim().parse().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert_eq!(parse_reply("120"), Ok("120".to_string()));
        assert_eq!(parse_reply(""), Ok(String::new()));
        assert_eq!(parse_reply("error: code: 403"), Err(TransportError::Code(403)));
        assert_eq!(
            parse_reply("error: tunnel not started"),
            Err(TransportError::Remote("tunnel not started".to_string()))
        );
    }

    #[test]
    fn test_pause_seconds() {
        assert_eq!(parse_pause_seconds("off"), 0);
        assert_eq!(parse_pause_seconds("299"), 299);
        assert_eq!(parse_pause_seconds("garbage"), 0);
    }

    #[test]
    fn test_request_encoding_keeps_body_spaces() {
        let cmd = TunnelCommand::Request {
            url: "https://api.example.net/v2/lease".to_string(),
            method: "POST".to_string(),
            body: "{\"a\": 1, \"b\": 2}".to_string(),
        };
        let wire = cmd.encode();
        assert!(wire.starts_with("request https://api.example.net/v2/lease POST :body: "));
        assert_eq!(TunnelCommand::decode(&wire), Some(cmd));
    }

    #[test]
    fn test_connect_display_hides_private_key() {
        let cmd = TunnelCommand::Connect {
            private_key: "SECRET".to_string(),
            gateway_public_key: "GW".to_string(),
            ipv4: "1.2.3.4".to_string(),
            ipv6: "::1".to_string(),
            port: 51820,
            vip4: "10.0.0.2".to_string(),
            vip6: "fd00::2".to_string(),
            dns: "2001:678:e34:1d::a1:b2c3".to_string(),
        };
        assert!(!cmd.to_string().contains("SECRET"));
        assert_eq!(cmd.encode().split(' ').count(), 9);
        assert_eq!(TunnelCommand::decode(&cmd.encode()), Some(cmd));
    }

    #[test]
    fn test_pause_wire_form() {
        assert_eq!(TunnelCommand::Pause(0).encode(), "pause 0");
        assert_eq!(TunnelCommand::decode("pause 300"), Some(TunnelCommand::Pause(300)));
        assert_eq!(TunnelCommand::decode("stats"), None);
    }
}
