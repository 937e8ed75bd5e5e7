use crate::well_known::{ANNOTATION_DELETE_CLUSTER, ANNOTATION_DELETION_SCHEDULE};
use crate::{ApisError, StatusConditions};
use chrono::prelude::*;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A remote Kubernetes cluster managed on behalf of an organization.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "greenhouse.sap",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"AccessState","type":"string","jsonPath":".status.accessState"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub access_mode: ClusterAccessMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAccessMode {
    #[default]
    Direct,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display,
)]
pub enum ClusterAccessState {
    #[default]
    Pending,
    Ready,
    Expiring,
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub access_state: ClusterAccessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_expiration_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renewal_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default)]
    pub status_conditions: StatusConditions,
}

impl Cluster {
    pub fn access_state(&self) -> ClusterAccessState {
        self.status
            .as_ref()
            .map(|status| status.access_state)
            .unwrap_or_default()
    }

    /// The stored credential is believed to work, whether or not the cluster
    /// is being deleted.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self.access_state(),
            ClusterAccessState::Ready | ClusterAccessState::Expiring
        )
    }

    /// Remote operations may only target clusters with a live credential.
    pub fn is_usable(&self) -> bool {
        self.metadata.deletion_timestamp.is_none() && self.is_reachable()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.annotations().contains_key(ANNOTATION_DELETE_CLUSTER)
    }

    pub fn deletion_schedule(&self) -> Result<Option<DateTime<Utc>>, ApisError> {
        self.annotations()
            .get(ANNOTATION_DELETION_SCHEDULE)
            .map(|value| {
                DateTime::parse_from_rfc3339(value)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|source| ApisError::InvalidTimestampAnnotation {
                        annotation: ANNOTATION_DELETION_SCHEDULE,
                        source,
                    })
            })
            .transpose()
    }

    pub fn bearer_token_expiry(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|status| status.bearer_token_expiration_timestamp)
    }
}
