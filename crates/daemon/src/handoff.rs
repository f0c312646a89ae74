//! Platform handoff: starting the consumer application against an endpoint.
//!
//! What "starting the consumer" means is platform specific, so the daemon
//! only knows the [`PlatformHandoff`] trait. [`LogHandoff`] just reports the
//! target; [`CommandHandoff`] runs a configured program.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use discovery::inventory::interface_for;
use discovery::NetworkInventory;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Best-effort description of the local network the headunit was found on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkContextHint {
    /// Name of the local interface whose subnet contains the headunit.
    pub interface: Option<String>,
    /// Local address on that interface.
    pub local_addr: Option<Ipv4Addr>,
}

impl NetworkContextHint {
    /// Looks up the interface that can reach `host`. Empty if none matches.
    pub fn for_host<I>(inventory: &I, host: IpAddr) -> Self
    where
        I: NetworkInventory + ?Sized,
    {
        match interface_for(inventory, host) {
            Some(iface) => Self {
                interface: Some(iface.name),
                local_addr: Some(iface.ip),
            },
            None => Self::default(),
        }
    }
}

/// Where the consumer should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffTarget {
    pub address: IpAddr,
    pub port: u16,
    pub network: NetworkContextHint,
}

impl fmt::Display for HandoffTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)?;
        if let Some(iface) = &self.network.interface {
            write!(f, " via {}", iface)?;
        }
        Ok(())
    }
}

/// Handoff failures.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff command is empty")]
    EmptyCommand,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Starts the consumer against a target.
///
/// A handoff only starts the consumer. Whether the session came up is
/// learned later from connection signals, never from the handoff itself.
pub trait PlatformHandoff: Send + Sync {
    fn hand_off<'a>(
        &'a self,
        target: &'a HandoffTarget,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandoffError>> + Send + 'a>>;

    /// Tears down whatever earlier handoffs left running.
    fn stop(&self) {}
}

/// Handoff that only logs the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandoff;

impl PlatformHandoff for LogHandoff {
    fn hand_off<'a>(
        &'a self,
        target: &'a HandoffTarget,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandoffError>> + Send + 'a>> {
        Box::pin(async move {
            info!("Consumer should now connect to {}", target);
            Ok(())
        })
    }
}

/// Handoff that runs a program.
///
/// Arguments may contain `{host}`, `{port}` and `{interface}`; they are
/// replaced with the target's values (`{interface}` becomes empty when the
/// interface is unknown). The handoff returns once the program is spawned.
/// Its exit status is only logged; [`stop`](PlatformHandoff::stop) kills
/// programs still running.
#[derive(Debug)]
pub struct CommandHandoff {
    argv: Vec<String>,
    children: TaskTracker,
    cancel: Mutex<CancellationToken>,
}

impl CommandHandoff {
    pub fn new(argv: Vec<String>) -> Result<Self, HandoffError> {
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(HandoffError::EmptyCommand);
        }
        Ok(Self {
            argv,
            children: TaskTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// The command line for `target`, placeholders expanded.
    pub fn expand(&self, target: &HandoffTarget) -> Vec<String> {
        let host = target.address.to_string();
        let port = target.port.to_string();
        let interface = target.network.interface.clone().unwrap_or_default();

        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{host}", &host)
                    .replace("{port}", &port)
                    .replace("{interface}", &interface)
            })
            .collect()
    }

    /// Number of spawned programs not yet reaped.
    pub fn running(&self) -> usize {
        self.children.len()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PlatformHandoff for CommandHandoff {
    fn hand_off<'a>(
        &'a self,
        target: &'a HandoffTarget,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandoffError>> + Send + 'a>> {
        Box::pin(async move {
            let argv = self.expand(target);
            let Some((program, args)) = argv.split_first() else {
                return Err(HandoffError::EmptyCommand);
            };

            info!("Handing off {} to {}", target, program);
            debug!("Handoff command: {:?}", argv);

            let child = Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| HandoffError::Spawn {
                    program: program.clone(),
                    source,
                })?;

            self.children
                .spawn(reap(program.clone(), child, self.cancel_token()));
            Ok(())
        })
    }

    fn stop(&self) {
        let previous = std::mem::replace(
            &mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();
    }
}

/// Waits for a handoff program and logs how it ended.
async fn reap(program: String, mut child: Child, cancel: CancellationToken) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => debug!("{} exited", program),
            Ok(status) => warn!("{} exited with {}", program, status),
            Err(e) => warn!("Failed to wait for {}: {}", program, e),
        },
        _ = cancel.cancelled() => {
            info!("Stopping {}", program);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
        }
    }
}

/// Builds the handoff described by a configured command line.
pub fn from_command(argv: &[String]) -> Result<Box<dyn PlatformHandoff>, HandoffError> {
    if argv.is_empty() {
        return Ok(Box::new(LogHandoff));
    }
    Ok(Box::new(CommandHandoff::new(argv.to_vec())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery::InterfaceAddr;

    struct OneInterface;

    impl NetworkInventory for OneInterface {
        fn interfaces(&self) -> discovery::Result<Vec<InterfaceAddr>> {
            Ok(vec![InterfaceAddr {
                name: "ap0".to_string(),
                ip: Ipv4Addr::new(192, 168, 43, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            }])
        }

        fn gateways(&self) -> discovery::Result<Vec<Ipv4Addr>> {
            Ok(Vec::new())
        }
    }

    fn target() -> HandoffTarget {
        HandoffTarget {
            address: "192.168.43.20".parse().unwrap(),
            port: 5288,
            network: NetworkContextHint::for_host(&OneInterface, "192.168.43.20".parse().unwrap()),
        }
    }

    #[test]
    fn test_network_hint_lookup() {
        let hint = NetworkContextHint::for_host(&OneInterface, "192.168.43.20".parse().unwrap());
        assert_eq!(hint.interface.as_deref(), Some("ap0"));
        assert_eq!(hint.local_addr, Some(Ipv4Addr::new(192, 168, 43, 1)));

        let none = NetworkContextHint::for_host(&OneInterface, "10.1.1.1".parse().unwrap());
        assert_eq!(none, NetworkContextHint::default());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "192.168.43.20:5288 via ap0");
    }

    #[test]
    fn test_expand_placeholders() {
        let handoff = CommandHandoff::new(vec![
            "launcher".to_string(),
            "--addr={host}:{port}".to_string(),
            "{interface}".to_string(),
        ])
        .unwrap();

        assert_eq!(
            handoff.expand(&target()),
            vec!["launcher", "--addr=192.168.43.20:5288", "ap0"]
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(CommandHandoff::new(vec![]), Err(HandoffError::EmptyCommand)));
        assert!(matches!(
            CommandHandoff::new(vec![String::new()]),
            Err(HandoffError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_log_handoff_succeeds() {
        assert!(LogHandoff.hand_off(&target()).await.is_ok());
    }

    async fn wait_reaped(handoff: &CommandHandoff) -> bool {
        for _ in 0..200 {
            if handoff.running() == 0 {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handoff_ignores_exit_status() {
        let ok = CommandHandoff::new(vec!["true".to_string()]).unwrap();
        assert!(ok.hand_off(&target()).await.is_ok());

        let failing = CommandHandoff::new(vec!["false".to_string()]).unwrap();
        assert!(failing.hand_off(&target()).await.is_ok());
        assert!(wait_reaped(&failing).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handoff_returns_before_program_exits() {
        let handoff = CommandHandoff::new(vec!["sleep".to_string(), "5".to_string()]).unwrap();

        let started = std::time::Instant::now();
        handoff.hand_off(&target()).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
        assert_eq!(handoff.running(), 1);

        handoff.stop();
        assert!(wait_reaped(&handoff).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_only_kills_earlier_programs() {
        let handoff = CommandHandoff::new(vec!["sleep".to_string(), "5".to_string()]).unwrap();

        handoff.hand_off(&target()).await.unwrap();
        handoff.stop();
        assert!(wait_reaped(&handoff).await);

        handoff.hand_off(&target()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handoff.running(), 1);

        handoff.stop();
        assert!(wait_reaped(&handoff).await);
    }

    #[tokio::test]
    async fn test_command_handoff_missing_program() {
        let handoff =
            CommandHandoff::new(vec!["/nonexistent/wireless-helper-launcher".to_string()]).unwrap();
        assert!(matches!(
            handoff.hand_off(&target()).await,
            Err(HandoffError::Spawn { .. })
        ));
    }

    #[test]
    fn test_from_command_defaults_to_log() {
        assert!(from_command(&[]).is_ok());
        assert!(from_command(&["launcher".to_string()]).is_ok());
    }
}
