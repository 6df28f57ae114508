use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Self-reported health of one stage service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,
}

impl ServiceHealth {
    pub fn healthy(elapsed_ms: Option<f64>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
            elapsed_ms,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            detail: Some(detail.into()),
            elapsed_ms: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
            elapsed_ms: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregate health of every service the pipeline depends on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_services: Vec<String>,
}

impl HealthReport {
    pub fn from_services(services: BTreeMap<String, ServiceHealth>) -> Self {
        let unhealthy_services: Vec<String> = services
            .iter()
            .filter(|(_, health)| !health.is_healthy())
            .map(|(name, _)| name.clone())
            .collect();
        let overall_status = if unhealthy_services.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            overall_status,
            services,
            unhealthy_services,
        }
    }
}
