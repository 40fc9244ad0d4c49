use super::Reconciler;
use crate::kinds::ManagedObject;
use crate::Result;

impl Reconciler<'_> {
    pub(crate) async fn create_or_update_crds(&mut self) -> Result<()> {
        let crds = self.strategy.crds().iter().cloned().map(ManagedObject::Crd).collect();
        self.apply_all(crds).await
    }
}
