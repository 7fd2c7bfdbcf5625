//! External reachability checks over HTTP.

use std::net::SocketAddr;

use async_trait::async_trait;

use bitchat_proto::echo::EchoReply;

use crate::config::ManagerConfig;
use crate::error::NetError;

/// Outcome of one echo check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoOutcome {
    /// The service dialed the advertised port successfully.
    pub reachable: bool,
    /// The public endpoint the service saw the caller from.
    pub endpoint: Option<SocketAddr>,
    /// No service could be reached or parsed; the result is inconclusive.
    pub error: bool,
}

/// Reachability probes used by the connectivity monitor. Trait so probe
/// logic can run against scripted outcomes in tests.
#[async_trait]
pub trait WebCheck: Send + Sync {
    /// Whether the general web is reachable at all.
    async fn web_accessible(&self) -> bool;

    /// Ask the echo service to dial back `external_port`.
    async fn echo(&self, external_port: u16) -> EchoOutcome;
}

/// `WebCheck` over HTTP: a HEAD request for general accessibility and a GET
/// against the echo service list, first parseable reply wins.
pub struct HttpWebCheck {
    http: reqwest::Client,
    echo_services: Vec<String>,
    web_check_url: String,
}

impl HttpWebCheck {
    pub fn new(config: &ManagerConfig) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            echo_services: config.echo_services.clone(),
            web_check_url: config.web_check_url.clone(),
        })
    }
}

#[async_trait]
impl WebCheck for HttpWebCheck {
    async fn web_accessible(&self) -> bool {
        // any HTTP response at all proves the web is reachable
        match self.http.head(&self.web_check_url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("web accessibility check failed: {}", e);
                false
            }
        }
    }

    async fn echo(&self, external_port: u16) -> EchoOutcome {
        for service in &self.echo_services {
            let url = format!("{}?port={}", service, external_port);
            let body = match self.http.get(&url).send().await {
                Ok(response) => match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!("echo service {} body read failed: {}", service, e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::debug!("echo service {} request failed: {}", service, e);
                    continue;
                }
            };

            match EchoReply::decode(&body) {
                Ok(reply) => {
                    tracing::debug!(
                        "echo service {} answered: reachable={} endpoint={:?}",
                        service,
                        reply.reachable,
                        reply.endpoint
                    );
                    return EchoOutcome {
                        reachable: reply.reachable,
                        endpoint: reply.endpoint,
                        error: false,
                    };
                }
                Err(e) => {
                    tracing::debug!("echo service {} sent a malformed reply: {}", service, e);
                }
            }
        }

        tracing::warn!("echo check failed on every configured service");
        EchoOutcome {
            reachable: false,
            endpoint: None,
            error: true,
        }
    }
}
