pub mod metrics;
pub mod orchestrator;
pub mod template;

pub use metrics::{
    AuditEvent, AuditLog, HealthStatus, MetricSample, MetricsStore, PerformanceStats,
    SystemHealth, WorkflowAnalytics,
};
pub use orchestrator::{AgentInfo, ErrorReport, MultiAgentOrchestrator, SecurityPolicy};
pub use template::TemplateSummary;
