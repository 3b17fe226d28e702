/// System module: workspace layout, content fingerprints, status reporting

pub mod integrity;
pub mod paths;
pub mod status;

pub use status::{HealthStatus, StatusReport, StatusReporter};
