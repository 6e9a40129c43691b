//! Local admin channel: a Unix-domain socket under `~/.box/run/`, newline-
//! terminated text commands in, one JSON object per line out. Every response
//! carries a top-level `status` key.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::AdminRequest;
use crate::logging::LogHandle;

/// How long a forwarded request may wait on the broker.
const BROKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Admin server configuration and handles.
pub struct AdminServer {
    pub socket_path: PathBuf,
    pub broker: mpsc::Sender<AdminRequest>,
    pub log: LogHandle,
    /// Inputs for on-demand NAT probes.
    pub nat_gateway_override: Option<Ipv4Addr>,
    pub nat_internal_port: u16,
}

/// One parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AdminCommand {
    Status,
    Stats,
    Reload(Option<PathBuf>),
    Locate(Uuid),
    NatProbe { gateway: Option<Ipv4Addr> },
    LocationSummary,
    SetLogTarget(String),
}

fn parse_command(line: &str) -> Result<AdminCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty-command".to_string());
    };
    let command = match verb {
        "status" => AdminCommand::Status,
        "stats" => AdminCommand::Stats,
        "location-summary" => AdminCommand::LocationSummary,
        "reload" => AdminCommand::Reload(words.next().map(PathBuf::from)),
        "locate" => {
            let raw = words.next().ok_or("locate requires a uuid")?;
            let target = raw.parse().map_err(|_| format!("invalid uuid {raw:?}"))?;
            AdminCommand::Locate(target)
        }
        "nat-probe" => {
            let mut gateway = None;
            while let Some(flag) = words.next() {
                match flag {
                    "--gateway" => {
                        let raw = words.next().ok_or("--gateway requires an address")?;
                        gateway =
                            Some(raw.parse().map_err(|_| format!("invalid gateway {raw:?}"))?);
                    }
                    other => return Err(format!("unknown flag {other:?}")),
                }
            }
            AdminCommand::NatProbe { gateway }
        }
        "set-log-target" => {
            let spec = words.next().ok_or("set-log-target requires a target")?;
            AdminCommand::SetLogTarget(spec.to_string())
        }
        other => return Err(format!("unknown-command {other:?}")),
    };
    if words.next().is_some() {
        return Err("trailing arguments".to_string());
    }
    Ok(command)
}

impl AdminServer {
    /// Accept loop. Bound to the private run directory; the socket file is
    /// chmod 0o600.
    #[cfg(unix)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        use tokio::net::UnixListener;

        // A previous daemon may have left the socket file behind.
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(path = %self.socket_path.display(), error = %e, "admin channel unavailable");
                return;
            }
        };
        if let Err(e) = restrict_socket(&self.socket_path) {
            warn!(error = %e, "could not restrict admin socket mode");
        }
        debug!(path = %self.socket_path.display(), "admin channel listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone_handles();
                        tokio::spawn(async move { server.serve_connection(stream).await });
                    }
                    Err(e) => warn!(error = %e, "admin accept failed"),
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        debug!("admin channel stopped");
    }

    #[cfg(not(unix))]
    pub async fn run(self, _shutdown: watch::Receiver<bool>) {
        warn!("admin channel requires unix domain sockets on this platform");
    }

    fn clone_handles(&self) -> AdminConnection {
        AdminConnection {
            broker: self.broker.clone(),
            log: self.log.clone(),
            nat_gateway_override: self.nat_gateway_override,
            nat_internal_port: self.nat_internal_port,
        }
    }
}

struct AdminConnection {
    broker: mpsc::Sender<AdminRequest>,
    log: LogHandle,
    nat_gateway_override: Option<Ipv4Addr>,
    nat_internal_port: u16,
}

impl AdminConnection {
    #[cfg(unix)]
    async fn serve_connection(self, stream: tokio::net::UnixStream) {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut writer = BufWriter::new(write_half);
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line).await;
            let mut encoded = response.to_string();
            encoded.push('\n');
            if writer.write_all(encoded.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(&self, line: &str) -> Value {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => return json!({ "status": "error", "message": message }),
        };
        match command {
            AdminCommand::Status => self.forward(|reply| AdminRequest::Status { reply }).await,
            AdminCommand::Stats => self.forward(|reply| AdminRequest::Stats { reply }).await,
            AdminCommand::LocationSummary => {
                self.forward(|reply| AdminRequest::LocationSummary { reply })
                    .await
            }
            AdminCommand::Locate(target) => {
                self.forward(|reply| AdminRequest::Locate { target, reply })
                    .await
            }
            AdminCommand::Reload(path) => {
                self.forward(|reply| AdminRequest::Reload { path, reply })
                    .await
            }
            AdminCommand::NatProbe { gateway } => {
                let gateway = gateway.or(self.nat_gateway_override);
                let reports = box_control::nat::probe(gateway, self.nat_internal_port).await;
                json!({ "status": "ok", "reports": reports })
            }
            AdminCommand::SetLogTarget(spec) => match self.log.set_target(&spec) {
                Ok(()) => json!({ "status": "ok", "target": spec }),
                Err(message) => json!({ "status": "error", "message": message }),
            },
        }
    }

    async fn forward<F>(&self, build: F) -> Value
    where
        F: FnOnce(oneshot::Sender<Value>) -> AdminRequest,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.broker.send(build(reply_tx)).await.is_err() {
            return json!({ "status": "error", "message": "broker unavailable" });
        }
        match tokio::time::timeout(BROKER_TIMEOUT, reply_rx).await {
            Ok(Ok(value)) => value,
            _ => json!({ "status": "error", "message": "broker timeout" }),
        }
    }
}

#[cfg(unix)]
fn restrict_socket(path: &std::path::Path) -> std::io::Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, Permissions::from_mode(0o600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_command("status").unwrap(), AdminCommand::Status);
        assert_eq!(parse_command("stats").unwrap(), AdminCommand::Stats);
        assert_eq!(
            parse_command("location-summary").unwrap(),
            AdminCommand::LocationSummary
        );
    }

    #[test]
    fn parses_reload_with_optional_path() {
        assert_eq!(parse_command("reload").unwrap(), AdminCommand::Reload(None));
        assert_eq!(
            parse_command("reload /tmp/Box.toml").unwrap(),
            AdminCommand::Reload(Some(PathBuf::from("/tmp/Box.toml")))
        );
    }

    #[test]
    fn parses_locate_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_command(&format!("locate {id}")).unwrap(),
            AdminCommand::Locate(id)
        );
        assert!(parse_command("locate not-a-uuid").is_err());
        assert!(parse_command("locate").is_err());
    }

    #[test]
    fn parses_nat_probe_gateway() {
        assert_eq!(
            parse_command("nat-probe").unwrap(),
            AdminCommand::NatProbe { gateway: None }
        );
        assert_eq!(
            parse_command("nat-probe --gateway 192.168.1.1").unwrap(),
            AdminCommand::NatProbe {
                gateway: Some(Ipv4Addr::new(192, 168, 1, 1))
            }
        );
        assert!(parse_command("nat-probe --gateway").is_err());
        assert!(parse_command("nat-probe --bogus").is_err());
    }

    #[test]
    fn rejects_unknown_and_trailing() {
        assert!(parse_command("destroy-everything").is_err());
        assert!(parse_command("status extra").is_err());
        assert!(parse_command("   ").is_err());
    }
}
