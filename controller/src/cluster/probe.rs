use crate::k8s::kubeconfig::{self, KubeconfigError};
use crate::k8s::RemoteCluster;
use greenhouse_apis::well_known::GREENHOUSE_KUBECONFIG_KEY;
use greenhouse_apis::{ClusterAccessState, ClusterStatus, Condition, ConditionType};
use k8s_openapi::api::core::v1::Secret;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    #[error("API server did not answer within {0:?}")]
    Timeout(Duration),

    #[error("API server unreachable: {0}")]
    Unreachable(#[from] kube::Error),
}

impl ProbeError {
    fn reason(&self) -> &'static str {
        match self {
            Self::Kubeconfig(_) => "KubeConfigInvalid",
            Self::Timeout(_) | Self::Unreachable(_) => "ClusterUnreachable",
        }
    }
}

/// A live connection to a remote cluster.
pub struct Probe {
    pub remote: RemoteCluster,
    pub kubernetes_version: String,
    /// The operator-managed kubeconfig was present but did not work.
    pub fell_back: bool,
}

/// Connects with the operator-managed kubeconfig first and the user-provided
/// one second, returning the first that answers a version request.
#[tracing::instrument(skip_all, fields(%namespace, %name))]
pub async fn connect(
    secret: &Secret,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<Probe, ProbeError> {
    let mut last_error = None;
    for (key, bytes) in kubeconfig::candidates(secret) {
        match probe(namespace, name, key, bytes, timeout).await {
            Ok((remote, kubernetes_version)) => {
                debug!(key, %kubernetes_version, "cluster answered");
                return Ok(Probe {
                    remote,
                    kubernetes_version,
                    fell_back: last_error.is_some() && key != GREENHOUSE_KUBECONFIG_KEY,
                });
            }
            Err(err) => {
                warn!(key, "probe failed: {err}");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or(ProbeError::Kubeconfig(KubeconfigError::Missing)))
}

async fn probe(
    namespace: &str,
    name: &str,
    key: &'static str,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(RemoteCluster, String), ProbeError> {
    let kubeconfig = kubeconfig::parse(key, bytes)?;
    let remote = RemoteCluster::from_kubeconfig(namespace, name, kubeconfig, timeout).await?;
    let client = &remote.client;
    let version = tryhard::retry_fn(|| async move {
        match tokio::time::timeout(timeout, client.apiserver_version()).await {
            Ok(result) => result.map_err(ProbeError::from),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    })
    .retries(2)
    .fixed_backoff(Duration::from_millis(500))
    .await?;
    Ok((remote, version.git_version))
}

/// Status after a liveness probe. Pending and Invalid clusters become Ready
/// on success. Ready and Expiring are owned by credential renewal and stay
/// as they are. Any failure invalidates the cluster.
pub fn probed_status(
    current: Option<&ClusterStatus>,
    outcome: &Result<Probe, ProbeError>,
) -> ClusterStatus {
    let mut status = current.cloned().unwrap_or_default();
    match outcome {
        Ok(probe) => {
            if matches!(
                status.access_state,
                ClusterAccessState::Pending | ClusterAccessState::Invalid
            ) {
                status.access_state = ClusterAccessState::Ready;
                status.renewal_failures = 0;
            }
            if probe.fell_back {
                status.bearer_token_expiration_timestamp = None;
            }
            status.kubernetes_version = Some(probe.kubernetes_version.clone());
            status
                .status_conditions
                .set(Condition::new(ConditionType::KubeConfigValid, true));
            status
                .status_conditions
                .set(Condition::new(ConditionType::Ready, true));
        }
        Err(err) => {
            status.access_state = ClusterAccessState::Invalid;
            status.status_conditions.set(Condition::new(
                ConditionType::KubeConfigValid,
                !matches!(err, ProbeError::Kubeconfig(_)),
            ));
            status.status_conditions.set(
                Condition::new(ConditionType::Ready, false)
                    .with_reason(err.reason())
                    .with_message(err.to_string()),
            );
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::offline_client;
    use chrono::prelude::*;
    use greenhouse_apis::kubeconfig::KubeconfigProblem;
    use greenhouse_apis::well_known::KUBECONFIG_KEY;
    use secrecy::SecretString;

    fn probe(fell_back: bool) -> Probe {
        Probe {
            remote: RemoteCluster {
                namespace: "org".to_owned(),
                name: "c1".to_owned(),
                client: offline_client(),
                kubeconfig: SecretString::new(String::new()),
            },
            kubernetes_version: "v1.30.2".to_owned(),
            fell_back,
        }
    }

    fn status(access_state: ClusterAccessState) -> ClusterStatus {
        ClusterStatus {
            access_state,
            bearer_token_expiration_timestamp: Some(Utc::now()),
            renewal_failures: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pending_and_invalid_become_ready() {
        for state in [ClusterAccessState::Pending, ClusterAccessState::Invalid] {
            let next = probed_status(Some(&status(state)), &Ok(probe(false)));
            assert_eq!(next.access_state, ClusterAccessState::Ready);
            assert_eq!(next.renewal_failures, 0);
            assert_eq!(next.kubernetes_version.as_deref(), Some("v1.30.2"));
            assert!(next.status_conditions.is_true(ConditionType::Ready));
        }
        let next = probed_status(None, &Ok(probe(false)));
        assert_eq!(next.access_state, ClusterAccessState::Ready);
    }

    #[tokio::test]
    async fn expiring_is_left_to_renewal() {
        let next = probed_status(Some(&status(ClusterAccessState::Expiring)), &Ok(probe(false)));
        assert_eq!(next.access_state, ClusterAccessState::Expiring);
        assert_eq!(next.renewal_failures, 3);
    }

    #[tokio::test]
    async fn fallback_forces_renewal() {
        let next = probed_status(Some(&status(ClusterAccessState::Ready)), &Ok(probe(true)));
        assert_eq!(next.bearer_token_expiration_timestamp, None);
    }

    #[test]
    fn failure_invalidates() {
        let err = ProbeError::Kubeconfig(KubeconfigError::Invalid {
            key: KUBECONFIG_KEY,
            problem: KubeconfigProblem::NoCurrentContext,
        });
        let next = probed_status(Some(&status(ClusterAccessState::Ready)), &Err(err));
        assert_eq!(next.access_state, ClusterAccessState::Invalid);
        assert!(!next.status_conditions.is_true(ConditionType::KubeConfigValid));
        let ready = next.status_conditions.get(ConditionType::Ready).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("KubeConfigInvalid"));

        let next = probed_status(None, &Err(ProbeError::Timeout(Duration::from_secs(30))));
        assert_eq!(next.access_state, ClusterAccessState::Invalid);
        assert!(next.status_conditions.is_true(ConditionType::KubeConfigValid));
    }
}
