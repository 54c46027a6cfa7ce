use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use sandbox_driver::{DeploymentConfig, DriverOutcome, ProvisioningDriver};

use crate::error::DriverCallError;

/// Moves blocking driver calls onto tokio's blocking pool.
///
/// Deadlines are applied by the caller's [`crate::retry::RetryPolicy`]; a
/// call that overruns keeps its blocking thread until the driver returns.
/// `plan`, `apply` and `destroy` start the blocking call right away and
/// return a future that owns everything it needs.
#[derive(Clone)]
pub struct DriverRunner {
    driver: Arc<dyn ProvisioningDriver>,
}

impl DriverRunner {
    pub fn new(driver: Arc<dyn ProvisioningDriver>) -> Self {
        Self { driver }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, DriverCallError>
    where
        F: FnOnce(&dyn ProvisioningDriver) -> sandbox_driver::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        tokio::task::spawn_blocking(move || f(driver.as_ref()))
            .await
            .map_err(|e| DriverCallError::Join(e.to_string()))?
            .map_err(DriverCallError::from)
    }

    /// Like [`DriverRunner::call`] for plan/apply/destroy, folding a panicked
    /// task into a failed outcome.
    fn outcome<F>(&self, f: F) -> impl Future<Output = DriverOutcome> + Send + 'static
    where
        F: FnOnce(&dyn ProvisioningDriver) -> DriverOutcome + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let task = tokio::task::spawn_blocking(move || f(driver.as_ref()));
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => DriverOutcome::failure(DriverCallError::Join(e.to_string()).to_string()),
            }
        }
    }

    pub async fn create(&self, id: &str, config: DeploymentConfig) -> Result<(), DriverCallError> {
        let id = id.to_string();
        self.call(move |d| d.create(&id, &config)).await
    }

    pub fn plan(&self, id: &str) -> impl Future<Output = DriverOutcome> + Send + 'static {
        let id = id.to_string();
        self.outcome(move |d| d.plan(&id))
    }

    pub fn apply(&self, id: &str) -> impl Future<Output = DriverOutcome> + Send + 'static {
        let id = id.to_string();
        self.outcome(move |d| d.apply(&id))
    }

    pub fn destroy(&self, id: &str) -> impl Future<Output = DriverOutcome> + Send + 'static {
        let id = id.to_string();
        self.outcome(move |d| d.destroy(&id))
    }

    pub async fn outputs(&self, id: &str) -> Result<BTreeMap<String, String>, DriverCallError> {
        let id = id.to_string();
        self.call(move |d| d.outputs(&id)).await
    }

    pub async fn strip_stale_reference(
        &self,
        id: &str,
        resource_address: &str,
    ) -> Result<(), DriverCallError> {
        let id = id.to_string();
        let address = resource_address.to_string();
        self.call(move |d| d.strip_stale_reference(&id, &address))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_driver::mock::{DriverCall, MockDriver};

    #[tokio::test]
    async fn forwards_calls_to_the_driver() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure("boom"));
        let runner = DriverRunner::new(mock.clone());

        let config = DeploymentConfig::chained("dep-1", "ws-1", [("m-1", "Ada")]);
        runner.create("dep-1", config).await.unwrap();
        assert!(runner.plan("dep-1").await.ok);
        assert!(!runner.apply("dep-1").await.ok);
        let outputs = runner.outputs("dep-1").await.unwrap();

        assert_eq!(outputs.get("m-1.project_id").map(String::as_str), Some("proj-m-1"));
        assert_eq!(
            mock.calls(),
            vec![
                DriverCall::Create("dep-1".into()),
                DriverCall::Plan("dep-1".into()),
                DriverCall::Apply("dep-1".into()),
                DriverCall::Outputs("dep-1".into()),
            ]
        );
        assert_eq!(runner.driver_name(), "mock");
    }

    #[tokio::test]
    async fn driver_errors_surface_as_call_errors() {
        let mock = Arc::new(MockDriver::new());
        let runner = DriverRunner::new(mock);

        let err = runner.outputs("never-created").await.unwrap_err();
        assert!(matches!(err, DriverCallError::Driver(_)));
    }
}
