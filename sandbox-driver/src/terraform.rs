//! Terraform-backed driver.
//!
//! Layout under `root_dir`:
//!
//! ```text
//! <root>/<deployment_id>/          one terraform working directory per batch
//! <root>/<deployment_id>/*.tf      copied from the template directory
//! <root>/<deployment_id>/sandbox.auto.tfvars.json
//! <root>/.members/<member_id>      contains the owning deployment id
//! ```
//!
//! The template is expected to instantiate `module.member[<member_id>]` for
//! each declared member and to export one object output per member id.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::command::{is_tool_installed, run_captured, CommandOutput};
use crate::config::DeploymentConfig;
use crate::error::{DriverError, Result};
use crate::{DriverOutcome, ProvisioningDriver};

const TFVARS_FILE: &str = "sandbox.auto.tfvars.json";
const PLAN_FILE: &str = "tfplan";
const MEMBER_INDEX_DIR: &str = ".members";

#[derive(Debug, Clone)]
pub struct TerraformDriver {
    binary: PathBuf,
    root_dir: PathBuf,
    template_dir: PathBuf,
    command_timeout: Option<Duration>,
    destroy_timeout: Option<Duration>,
}

/// Where a driver id points to.
enum Target {
    Deployment(PathBuf),
    Member { dir: PathBuf, member_id: String },
}

impl TerraformDriver {
    pub fn new(
        binary: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
        template_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            root_dir: root_dir.into(),
            template_dir: template_dir.into(),
            command_timeout: None,
            destroy_timeout: None,
        }
    }

    /// Hard ceiling for a single terraform invocation. The orchestrator sets
    /// its own deadlines; this one only guarantees the child is reaped.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Ceiling for `destroy`, which runs under a shorter deadline than the
    /// other commands. Falls back to the command timeout when unset.
    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = Some(timeout);
        self
    }

    /// Fails early when the configured binary cannot be found.
    pub fn check_installed(&self) -> Result<()> {
        let binary = self.binary.to_string_lossy();
        if self.binary.is_absolute() {
            if self.binary.exists() {
                return Ok(());
            }
        } else if is_tool_installed(&binary) {
            return Ok(());
        }
        Err(DriverError::ToolMissing(binary.into_owned()))
    }

    fn deployment_dir(&self, id: &str) -> PathBuf {
        self.root_dir.join(id)
    }

    fn member_index(&self, member_id: &str) -> PathBuf {
        self.root_dir.join(MEMBER_INDEX_DIR).join(member_id)
    }

    fn resolve(&self, id: &str) -> Result<Target> {
        validate_id(id)?;

        let dir = self.deployment_dir(id);
        if dir.is_dir() {
            return Ok(Target::Deployment(dir));
        }

        let index = self.member_index(id);
        if index.is_file() {
            let deployment = fs::read_to_string(&index)?;
            let deployment = deployment.trim();
            validate_id(deployment)?;
            return Ok(Target::Member {
                dir: self.deployment_dir(deployment),
                member_id: id.to_string(),
            });
        }

        Err(DriverError::UnknownWorkspace(id.to_string()))
    }

    fn terraform(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        self.terraform_within(dir, args, self.command_timeout)
    }

    fn terraform_within(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_captured(&self.binary, &args, dir, timeout)
    }

    /// Runs a command whose result the orchestrator interprets itself.
    fn outcome(&self, dir: &Path, args: &[&str]) -> DriverOutcome {
        self.outcome_within(dir, args, self.command_timeout)
    }

    fn outcome_within(&self, dir: &Path, args: &[&str], timeout: Option<Duration>) -> DriverOutcome {
        match self.terraform_within(dir, args, timeout) {
            Ok(out) if out.success => DriverOutcome::success(out.output),
            Ok(out) => DriverOutcome::failure(out.tail()),
            Err(e) => DriverOutcome::failure(e.to_string()),
        }
    }

    fn copy_templates(&self, dir: &Path) -> Result<usize> {
        let mut copied = 0;
        for entry in fs::read_dir(&self.template_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tf") {
                if let Some(name) = path.file_name() {
                    fs::copy(&path, dir.join(name))?;
                    copied += 1;
                }
            }
        }
        Ok(copied)
    }
}

impl ProvisioningDriver for TerraformDriver {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn create(&self, id: &str, config: &DeploymentConfig) -> Result<()> {
        validate_id(id)?;
        for member in &config.members {
            validate_id(&member.member_id)?;
        }

        let dir = self.deployment_dir(id);
        fs::create_dir_all(&dir)?;
        let copied = self.copy_templates(&dir)?;
        if copied == 0 {
            warn!(template_dir = %self.template_dir.display(), "no .tf files found in template directory");
        }

        let tfvars = json!({
            "deployment_id": config.deployment_id,
            "workshop_id": config.workshop_id,
            "members": config.members,
        });
        fs::write(dir.join(TFVARS_FILE), serde_json::to_vec_pretty(&tfvars)?)?;

        let index_dir = self.root_dir.join(MEMBER_INDEX_DIR);
        fs::create_dir_all(&index_dir)?;
        for member in &config.members {
            fs::write(index_dir.join(&member.member_id), id)?;
        }

        let out = self.terraform(&dir, &["init", "-input=false", "-no-color"])?;
        if !out.success {
            return Err(DriverError::Command {
                command: "terraform init".to_string(),
                output: out.tail(),
            });
        }

        info!(deployment_id = %id, members = config.members.len(), "terraform workspace initialised");
        Ok(())
    }

    fn plan(&self, id: &str) -> DriverOutcome {
        match self.resolve(id) {
            Ok(Target::Deployment(dir)) => self.outcome(
                &dir,
                &["plan", "-input=false", "-no-color", &format!("-out={PLAN_FILE}")],
            ),
            Ok(Target::Member { .. }) => {
                DriverOutcome::failure(format!("{id} is a member, plan runs per deployment"))
            }
            Err(e) => DriverOutcome::failure(e.to_string()),
        }
    }

    fn apply(&self, id: &str) -> DriverOutcome {
        match self.resolve(id) {
            Ok(Target::Deployment(dir)) => self.outcome(
                &dir,
                &["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE],
            ),
            Ok(Target::Member { .. }) => {
                DriverOutcome::failure(format!("{id} is a member, apply runs per deployment"))
            }
            Err(e) => DriverOutcome::failure(e.to_string()),
        }
    }

    fn destroy(&self, id: &str) -> DriverOutcome {
        let timeout = self.destroy_timeout.or(self.command_timeout);
        match self.resolve(id) {
            Ok(Target::Deployment(dir)) => self.outcome_within(
                &dir,
                &["destroy", "-input=false", "-no-color", "-auto-approve"],
                timeout,
            ),
            Ok(Target::Member { dir, member_id }) => {
                let target = format!("-target=module.member[\"{member_id}\"]");
                let outcome = self.outcome_within(
                    &dir,
                    &["destroy", "-input=false", "-no-color", "-auto-approve", &target],
                    timeout,
                );
                if outcome.ok {
                    if let Err(e) = fs::remove_file(self.member_index(&member_id)) {
                        warn!(member_id = %member_id, error = %e, "failed to drop member index entry");
                    }
                }
                outcome
            }
            // Nothing was ever deployed for this id.
            Err(DriverError::UnknownWorkspace(_)) => {
                DriverOutcome::success(format!("no deployment recorded for {id}, nothing to destroy"))
            }
            Err(e) => DriverOutcome::failure(e.to_string()),
        }
    }

    fn outputs(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let dir = match self.resolve(id)? {
            Target::Deployment(dir) | Target::Member { dir, .. } => dir,
        };

        let out = self.terraform(&dir, &["output", "-json", "-no-color"])?;
        if !out.success {
            return Err(DriverError::Command {
                command: "terraform output".to_string(),
                output: out.tail(),
            });
        }

        parse_outputs(&out.output)
    }

    fn strip_stale_reference(&self, id: &str, resource_address: &str) -> Result<()> {
        let dir = match self.resolve(id)? {
            Target::Deployment(dir) | Target::Member { dir, .. } => dir,
        };

        let out = self.terraform(&dir, &["state", "rm", "-no-color", resource_address])?;
        if !out.success {
            return Err(DriverError::Command {
                command: format!("terraform state rm {resource_address}"),
                output: out.tail(),
            });
        }

        info!(id = %id, address = %resource_address, "removed stale resource from terraform state");
        Ok(())
    }
}

/// Ids become directory names, so anything that could escape `root_dir` is
/// rejected.
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DriverError::InvalidId(id.to_string()))
    }
}

/// Flattens `terraform output -json`. Object outputs become `<name>.<field>`.
fn parse_outputs(raw: &str) -> Result<BTreeMap<String, String>> {
    let parsed: Value = serde_json::from_str(raw.trim())?;
    let Value::Object(entries) = parsed else {
        return Err(DriverError::Output(
            "expected a JSON object from terraform output".to_string(),
        ));
    };

    let mut flat = BTreeMap::new();
    for (name, entry) in entries {
        let value = entry.get("value").cloned().unwrap_or(entry);
        match value {
            Value::Object(fields) => {
                for (field, v) in fields {
                    flat.insert(format!("{name}.{field}"), scalar(v));
                }
            }
            other => {
                flat.insert(name, scalar(other));
            }
        }
    }
    Ok(flat)
}

fn scalar(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ids_that_escape_the_root() {
        assert!(validate_id("dep-ws1-batch-0").is_ok());
        assert!(validate_id("3f2c_a.b").is_ok());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(".members").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn flattens_object_outputs() {
        let raw = r#"{
            "m1": {"sensitive": false, "type": ["object", {}], "value": {"project_id": "p-1", "quota": 3}},
            "region": {"sensitive": false, "type": "string", "value": "fr-par"}
        }"#;

        let flat = parse_outputs(raw).unwrap();

        assert_eq!(flat["m1.project_id"], "p-1");
        assert_eq!(flat["m1.quota"], "3");
        assert_eq!(flat["region"], "fr-par");
    }

    #[test]
    fn output_must_be_an_object() {
        assert!(matches!(parse_outputs("[1,2]"), Err(DriverError::Output(_))));
        assert!(matches!(
            parse_outputs("not json"),
            Err(DriverError::Serialization(_))
        ));
    }

    #[test]
    fn destroy_of_unknown_id_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let driver = TerraformDriver::new("terraform", root.path(), root.path());

        let outcome = driver.destroy("never-deployed");

        assert!(outcome.ok);
        assert!(outcome.diagnostics.contains("nothing to destroy"));
    }

    #[test]
    fn member_ids_resolve_to_their_deployment() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("dep-1")).unwrap();
        fs::create_dir_all(root.path().join(MEMBER_INDEX_DIR)).unwrap();
        fs::write(root.path().join(MEMBER_INDEX_DIR).join("m1"), "dep-1\n").unwrap();
        let driver = TerraformDriver::new("terraform", root.path(), root.path());

        match driver.resolve("m1").unwrap() {
            Target::Member { dir, member_id } => {
                assert_eq!(dir, root.path().join("dep-1"));
                assert_eq!(member_id, "m1");
            }
            Target::Deployment(_) => panic!("expected member target"),
        }
        assert!(matches!(driver.resolve("dep-1").unwrap(), Target::Deployment(_)));
        assert!(matches!(
            driver.resolve("m2"),
            Err(DriverError::UnknownWorkspace(_))
        ));
    }
}
