//! Informational status maps, and the `Status` service that serves them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use canopy_network::{Message, Router, ServerIdentity};
use serde::{Deserialize, Serialize};

use crate::service::{Context, Service, ServiceProcessor, ServiceRegistry};
use crate::token::ServiceId;
use crate::{ClientError, OverlayError};

/// Name of the built-in status service and of the server's own reporter.
pub const STATUS_SERVICE: &str = "Status";

/// One reporter's view, ordered by key.
pub type Status = BTreeMap<String, String>;

pub trait StatusReporter: Send + Sync {
    fn status(&self) -> Status;
}

/// Reporters of one server, by name.
#[derive(Default)]
pub struct StatusRegistry {
    reporters: RwLock<BTreeMap<String, Arc<dyn StatusReporter>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reporter` under `name`, replacing any previous one.
    pub fn register(&self, name: &str, reporter: Arc<dyn StatusReporter>) {
        self.reporters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), reporter);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.reporters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.reporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Ask every reporter.
    pub fn report(&self) -> BTreeMap<String, Status> {
        let reporters: Vec<(String, Arc<dyn StatusReporter>)> = self
            .reporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, r)| (name.clone(), r.clone()))
            .collect();
        reporters
            .into_iter()
            .map(|(name, r)| (name, r.status()))
            .collect()
    }
}

// ── Server reporter ──────────────────────────────────────────────────────

pub(crate) struct ServerStatus {
    router: Router,
    started: Instant,
    services: Vec<String>,
}

impl ServerStatus {
    pub(crate) fn new(router: Router, services: Vec<String>) -> Self {
        Self {
            router,
            started: Instant::now(),
            services,
        }
    }
}

impl StatusReporter for ServerStatus {
    fn status(&self) -> Status {
        let si = self.router.server_identity();
        let mut status = Status::new();
        status.insert("Available_Services".into(), self.services.join(","));
        status.insert("TX_bytes".into(), self.router.tx().to_string());
        status.insert("RX_bytes".into(), self.router.rx().to_string());
        status.insert("Uptime".into(), format_uptime(self.started.elapsed()));
        status.insert(
            "System".into(),
            format!("{}/{}/rust", std::env::consts::OS, std::env::consts::ARCH),
        );
        status.insert("Version".into(), env!("CARGO_PKG_VERSION").into());
        status.insert("Host".into(), si.address.host().into());
        status.insert("Port".into(), si.address.port().to_string());
        status.insert("Description".into(), si.description.clone());
        status.insert("ConnType".into(), si.address.conn_type().to_string());
        status
    }
}

fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{:02}m{:02}s", secs / 3600, (secs / 60) % 60, secs % 60)
}

// ── Status service ───────────────────────────────────────────────────────

/// Ask a server for its status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusRequest {}

impl Message for StatusRequest {
    const NAME: &'static str = "Request";
}

/// Every reporter's map, keyed by reporter name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: BTreeMap<String, Status>,
    pub server_identity: ServerIdentity,
}

impl Message for StatusResponse {
    const NAME: &'static str = "Response";
}

/// Serves [`StatusRequest`] at `/Status/Request`.
pub struct StatusService {
    processor: ServiceProcessor,
}

impl StatusService {
    pub fn new(ctx: Context) -> Result<Self, OverlayError> {
        let processor = ServiceProcessor::new();
        let registry = ctx.status_registry().clone();
        let si = ctx.server_identity().clone();
        processor.register_handler(move |_: StatusRequest| {
            let response = StatusResponse {
                status: registry.report(),
                server_identity: si.clone(),
            };
            async move { Ok(response) }
        });
        Ok(Self { processor })
    }

    /// Add the status service to `registry`.
    pub fn register(registry: &ServiceRegistry) -> Result<ServiceId, OverlayError> {
        registry.register(STATUS_SERVICE, StatusService::new)
    }
}

#[async_trait]
impl Service for StatusService {
    async fn process_client_request(&self, path: &str, buf: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.processor.process_client_request(path, buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl StatusReporter for Fixed {
        fn status(&self) -> Status {
            Status::from([("Value".to_string(), self.0.to_string())])
        }
    }

    #[test]
    fn registry_reports_every_reporter_by_name() {
        let registry = StatusRegistry::new();
        registry.register("b", Arc::new(Fixed("2")));
        registry.register("a", Arc::new(Fixed("1")));
        registry.register("a", Arc::new(Fixed("3")));
        let report = registry.report();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report["a"]["Value"], "3");
        assert_eq!(report["b"]["Value"], "2");
        assert!(registry.unregister("a"));
        assert_eq!(registry.report().len(), 1);
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h02m05s");
        assert_eq!(format_uptime(Duration::from_secs(0)), "0h00m00s");
    }
}
