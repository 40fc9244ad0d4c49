//! Prometheus resources and the OpenShift security context constraints.
use super::Reconciler;
use crate::kinds::ManagedObject;
use crate::Result;

impl Reconciler<'_> {
    pub(crate) async fn create_or_update_service_monitors(&mut self) -> Result<()> {
        let monitors = self
            .strategy
            .service_monitors()
            .iter()
            .cloned()
            .map(ManagedObject::ServiceMonitor)
            .collect();
        self.apply_all(monitors).await
    }

    pub(crate) async fn create_or_update_prometheus_rules(&mut self) -> Result<()> {
        let rules = self
            .strategy
            .prometheus_rules()
            .iter()
            .cloned()
            .map(ManagedObject::PrometheusRule)
            .collect();
        self.apply_all(rules).await
    }

    pub(crate) async fn create_or_update_sccs(&mut self) -> Result<()> {
        let sccs = self.strategy.sccs().iter().cloned().map(ManagedObject::Scc).collect();
        self.apply_all(sccs).await
    }
}
