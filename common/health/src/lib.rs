use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the partition consumers of the service.
///
/// Every partition worker registers itself as a component and keeps
/// reporting while it is attached to its partition. The process status
/// is computed from the individual components according to a
/// [`HealthStrategy`]:
///   - `All`: every registered component must be healthy
///   - `Any`: a single healthy component is enough
///
/// A component that does not report before its deadline is considered
/// stalled. Components that exit cleanly deregister themselves and stop
/// counting towards the status.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status, computed with the registry strategy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise. The body lists every component.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, before the first report
    Starting,
    /// Recently reported healthy, must report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// The HealthyUntil deadline was reached without a new report
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

enum HealthMessage {
    Report {
        component: String,
        status: ComponentStatus,
    },
    Deregister {
        component: String,
    },
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Report healthy until now + deadline. Must be called more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage::Report {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Remove the component from the registry, consuming the handle.
    pub async fn deregister(self) {
        let message = HealthMessage::Deregister {
            component: self.component,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to deregister health component: {}", err)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStrategy {
    /// All components must be healthy for the registry to be healthy
    All,
    /// At least one component must be healthy for the registry to be healthy
    Any,
}

impl std::str::FromStr for HealthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "all" => Ok(HealthStrategy::All),
            "any" => Ok(HealthStrategy::Any),
            _ => Err(format!("Unknown Health Strategy: {s}, must be ALL or ANY")),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    strategy: HealthStrategy,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self::new_with_strategy(name, HealthStrategy::All)
    }

    /// Must be called from within a tokio runtime: a task applies the reports.
    pub fn new_with_strategy(name: &str, strategy: HealthStrategy) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            strategy,
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(mut map) = components.write() else {
                    // Poisoned lock: the probe fails and the process gets restarted
                    warn!("poisoned HealthRegistry lock");
                    continue;
                };
                match message {
                    HealthMessage::Report { component, status } => {
                        _ = map.insert(component, status);
                    }
                    HealthMessage::Deregister { component } => {
                        _ = map.remove(&component);
                    }
                }
            }
        });

        registry
    }

    /// Registers a component in Starting state and returns its reporting handle.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status from the currently registered components. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        // No component registered means nothing is consuming
        let mut result = HealthStatus {
            healthy: !components.is_empty() && self.strategy == HealthStrategy::All,
            components: HashMap::with_capacity(components.len()),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            match (self.strategy, status.is_healthy()) {
                (HealthStrategy::Any, true) => result.healthy = true,
                (HealthStrategy::All, false) => result.healthy = false,
                _ => {}
            }
            _ = result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{ComponentStatus, HealthRegistry, HealthStatus, HealthStrategy};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::Sub;
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn partition_goes_healthy_then_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("partition-0".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("partition-0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_unhealthy().await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("partition-0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn expired_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("partition-0".to_string(), Duration::from_secs(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| {
            registry.get_status().components.get("partition-0") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn any_strategy_tolerates_one_failed_partition() {
        let registry = HealthRegistry::new_with_strategy("liveness", HealthStrategy::Any);
        let first = registry
            .register("partition-0".to_string(), Duration::from_secs(30))
            .await;
        let second = registry
            .register("partition-1".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;
        assert!(!registry.get_status().healthy);

        first.report_healthy().await;
        second.report_unhealthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        first.report_unhealthy().await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn all_strategy_requires_every_partition() {
        let registry = HealthRegistry::new("liveness");
        let first = registry
            .register("partition-0".to_string(), Duration::from_secs(30))
            .await;
        let second = registry
            .register("partition-1".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        first.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("partition-0")
                != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        second.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn deregistered_component_is_dropped() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("partition-3".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;

        handle.deregister().await;
        assert_or_retry(|| registry.get_status().components.is_empty()).await;
    }

    #[test]
    fn parses_strategy() {
        assert_eq!("ALL".parse::<HealthStrategy>(), Ok(HealthStrategy::All));
        assert_eq!(" any ".parse::<HealthStrategy>(), Ok(HealthStrategy::Any));
        assert!("most".parse::<HealthStrategy>().is_err());
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
