pub mod metrics;
pub mod analytics;
#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use metrics::LiveMetrics;
pub use analytics::ObservabilityLayer;

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
