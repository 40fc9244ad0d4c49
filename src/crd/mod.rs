pub mod external;
pub mod kubevirt;

pub use external::{ApiService, PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor};
pub use kubevirt::*;
