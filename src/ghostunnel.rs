//! ghostunnel in client mode as the supervised proxy

use crate::child::Invocation;
use crate::config::ProxyConfig;
use crate::process::{ProxyFlavor, ProxyOptions};
use crate::target::Target;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Timeout of a single readiness connect
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs `ghostunnel client`, accepting plaintext locally and speaking TLS to the target
#[derive(Debug, Clone)]
pub struct Ghostunnel {
    command: String,
    listen: String,
}

impl Ghostunnel {
    pub fn new(command: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            listen: listen.into(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(&config.command, &config.listen)
    }
}

#[async_trait]
impl ProxyFlavor for Ghostunnel {
    fn invocation(&self, target: &Target, options: &ProxyOptions) -> Invocation {
        let mut invocation = Invocation::new(&self.command)
            .arg("client")
            .args(["--target".to_string(), target.to_string()])
            .args(["--listen", self.listen.as_str()]);

        if options.disable_authentication {
            invocation = invocation.arg("--disable-authentication");
        }
        if let Some(cacert) = &options.cacert {
            invocation = invocation.args(["--cacert".to_string(), cacert.display().to_string()]);
        }
        invocation.args(options.extra_args.iter().cloned())
    }

    /// Ready once the listen socket accepts a TCP connection
    async fn is_ready(&self, target: &Target) -> bool {
        match tokio::time::timeout(READINESS_CONNECT_TIMEOUT, TcpStream::connect(&self.listen)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(upstream = %target, listen = %self.listen, error = %e, "Listen socket not open yet");
                false
            }
            Err(_) => {
                debug!(upstream = %target, listen = %self.listen, "Readiness connect timed out");
                false
            }
        }
    }

    fn listen_addr(&self) -> &str {
        &self.listen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    #[test]
    fn test_minimal_invocation() {
        let flavor = Ghostunnel::new("ghostunnel", "localhost:8083");
        let invocation = flavor.invocation(&Target::new("google.com", 443), &ProxyOptions::default());
        assert_eq!(invocation.program, "ghostunnel");
        assert_eq!(
            invocation.args,
            vec!["client", "--target", "google.com:443", "--listen", "localhost:8083"]
        );
    }

    #[test]
    fn test_full_invocation() {
        let flavor = Ghostunnel::from_config(&ProxyConfig::default());
        let options = ProxyOptions {
            cacert: Some(PathBuf::from("tests/assets/ca.pem")),
            disable_authentication: true,
            extra_args: vec!["--quiet=conns".to_string()],
        };
        let invocation = flavor.invocation(&Target::new("10.0.0.7", 8443), &options);
        assert_eq!(
            invocation.args,
            vec![
                "client",
                "--target",
                "10.0.0.7:8443",
                "--listen",
                "localhost:8083",
                "--disable-authentication",
                "--cacert",
                "tests/assets/ca.pem",
                "--quiet=conns",
            ]
        );
    }

    #[tokio::test]
    async fn test_readiness_follows_listen_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let flavor = Ghostunnel::new("ghostunnel", addr.clone());
        let target = Target::new("example.com", 443);

        assert!(flavor.is_ready(&target).await);

        drop(listener);
        assert!(!flavor.is_ready(&target).await);
        assert_eq!(flavor.listen_addr(), addr);
    }
}
