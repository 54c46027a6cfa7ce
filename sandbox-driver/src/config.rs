//! The declarative description handed to a driver for one deployment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One batch of members deployed in a single driver invocation.
///
/// Members share a provider-side quota unit, so each member after the first
/// declares a dependency on its predecessor. Outputs are keyed by the member
/// id (`<member_id>.<handle>`), never by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub deployment_id: String,
    pub workshop_id: String,
    pub members: Vec<MemberDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDeclaration {
    pub member_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

impl DeploymentConfig {
    /// Builds the config for `members` in the given order, chaining each
    /// member onto the one before it.
    pub fn chained<I, S>(deployment_id: &str, workshop_id: &str, members: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut declarations: Vec<MemberDeclaration> = Vec::new();
        for (member_id, name) in members {
            let depends_on = declarations.last().map(|prev| prev.member_id.clone());
            declarations.push(MemberDeclaration {
                member_id: member_id.into(),
                name: name.into(),
                depends_on,
            });
        }

        Self {
            deployment_id: deployment_id.to_string(),
            workshop_id: workshop_id.to_string(),
            members: declarations,
        }
    }

    pub fn declares(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m.member_id == member_id)
    }
}

/// Extracts the handles exported for `member_id`, with the member prefix
/// stripped. Returns an empty map when the deployment exported nothing for it.
pub fn member_outputs(
    outputs: &BTreeMap<String, String>,
    member_id: &str,
) -> BTreeMap<String, String> {
    let prefix = format!("{member_id}.");
    outputs
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .filter(|handle| !handle.is_empty())
                .map(|handle| (handle.to_string(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_links_each_member_to_previous() {
        let config = DeploymentConfig::chained(
            "dep-1",
            "ws-1",
            vec![("m1", "alice"), ("m2", "bob"), ("m3", "carol")],
        );

        assert_eq!(config.members[0].depends_on, None);
        assert_eq!(config.members[1].depends_on.as_deref(), Some("m1"));
        assert_eq!(config.members[2].depends_on.as_deref(), Some("m2"));
        assert!(config.declares("m2"));
        assert!(!config.declares("m4"));
    }

    #[test]
    fn member_outputs_uses_id_prefix_only() {
        let outputs = BTreeMap::from([
            ("m1.project_id".to_string(), "p-1".to_string()),
            ("m1.access_key".to_string(), "ak-1".to_string()),
            ("m10.project_id".to_string(), "p-10".to_string()),
            ("m1.".to_string(), "junk".to_string()),
            ("region".to_string(), "fr-par".to_string()),
        ]);

        let handles = member_outputs(&outputs, "m1");

        assert_eq!(handles.len(), 2);
        assert_eq!(handles["project_id"], "p-1");
        assert_eq!(handles["access_key"], "ak-1");
        assert!(member_outputs(&outputs, "m2").is_empty());
    }
}
