//! Provisioning driver abstraction.
//!
//! A driver turns a declarative [`DeploymentConfig`] into real cloud
//! resources. Every call is synchronous and may block for minutes, so callers
//! are expected to run them on blocking threads. The orchestrator only ever
//! looks at the success flag and the free-form diagnostics of a call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod command;
pub mod config;
pub mod error;
pub mod terraform;

#[cfg(feature = "test-helpers")]
pub mod mock;

pub use config::{member_outputs, DeploymentConfig, MemberDeclaration};
pub use error::{DriverError, Result};
pub use terraform::TerraformDriver;

/// Result of a plan/apply/destroy call: a success flag plus whatever text the
/// underlying tool printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOutcome {
    pub ok: bool,
    pub diagnostics: String,
}

impl DriverOutcome {
    pub fn success(diagnostics: impl Into<String>) -> Self {
        Self {
            ok: true,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn failure(diagnostics: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// The contract every provisioning backend fulfils.
///
/// `id` names a driver workspace. Deployments are created per batch, so a
/// workspace id usually covers several members; `destroy` and
/// `strip_stale_reference` additionally accept a member id and resolve it to
/// the deployment that declared it.
pub trait ProvisioningDriver: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Prepare a workspace for `id` from the declarative configuration.
    fn create(&self, id: &str, config: &DeploymentConfig) -> Result<()>;

    fn plan(&self, id: &str) -> DriverOutcome;

    fn apply(&self, id: &str) -> DriverOutcome;

    fn destroy(&self, id: &str) -> DriverOutcome;

    /// Flat `key -> value` map of everything the deployment exported.
    fn outputs(&self, id: &str) -> Result<BTreeMap<String, String>>;

    /// Forget the resource at `resource_address` in the persisted state of
    /// `id` without touching anything else.
    fn strip_stale_reference(&self, id: &str, resource_address: &str) -> Result<()>;
}
