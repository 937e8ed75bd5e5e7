use crate::backoff::Backoff;
use crate::config::CredentialConfig;
use crate::context::{drain, error_policy, observe, Context};
use crate::errors::{ErrorKind, ObjectId, ReconcileContext, ReconcileResult};
use crate::k8s::kubeconfig::{self, KubeconfigError};
use crate::k8s::{patch_status, RemoteCluster};
use crate::metrics::TOKEN_RENEWALS;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::prelude::*;
use greenhouse_apis::well_known::{FIELD_MANAGER, GREENHOUSE_KUBECONFIG_KEY, SECRET_TYPE_KUBECONFIG};
use greenhouse_apis::{Cluster, ClusterAccessState, ClusterStatus, Condition, ConditionType};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::config::Kubeconfig;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONTROLLER: &str = "clusterCredential";

/// Lead time before expiry at which a token is renewed, capped at half the
/// token lifetime.
pub fn clamp_renew_before(token_validity: Duration, renew_before: Duration) -> Duration {
    renew_before.min(token_validity / 2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalSettings {
    pub token_validity: Duration,
    pub renew_before: Duration,
    pub max_failures: u32,
}

impl RenewalSettings {
    pub fn clamped(&self) -> Self {
        Self {
            renew_before: clamp_renew_before(self.token_validity, self.renew_before),
            ..self.clone()
        }
    }

    /// Time between a renewal and the next one.
    pub fn refresh_interval(&self) -> Duration {
        self.token_validity.saturating_sub(self.renew_before)
    }
}

impl From<&CredentialConfig> for RenewalSettings {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            token_validity: config.token_validity.into(),
            renew_before: config.renew_before.into(),
            max_failures: config.max_renewal_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalPlan {
    Wait(Duration),
    Renew,
}

fn remaining(now: DateTime<Utc>, expiry: DateTime<Utc>) -> Duration {
    (expiry - now).to_std().unwrap_or(Duration::ZERO)
}

/// Whether the token expiring at `expiry` is due. An unknown expiry is
/// always due.
pub fn plan_renewal(
    now: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    settings: &RenewalSettings,
) -> RenewalPlan {
    let settings = settings.clamped();
    match expiry.map(|expiry| remaining(now, expiry)) {
        Some(remaining) if remaining > settings.renew_before => {
            RenewalPlan::Wait(remaining - settings.renew_before)
        }
        _ => RenewalPlan::Renew,
    }
}

/// Like `plan_renewal`, but after failed attempts the next one waits out the
/// backoff counted from the last attempt, whatever triggered the reconcile.
pub fn plan_attempt(
    now: DateTime<Utc>,
    status: Option<&ClusterStatus>,
    settings: &RenewalSettings,
    backoff: &Backoff,
) -> RenewalPlan {
    let expiry = status.and_then(|status| status.bearer_token_expiration_timestamp);
    let plan = plan_renewal(now, expiry, settings);
    let Some(status) = status else {
        return plan;
    };
    let Some(attempt) = status.last_renewal_attempt else {
        return plan;
    };
    if plan != RenewalPlan::Renew || status.renewal_failures == 0 {
        return plan;
    }
    let delay = backoff.delay_for(status.renewal_failures - 1);
    let mut wait = delay.saturating_sub(remaining(attempt, now));
    if let Some(expiry) = expiry {
        wait = wait.min(remaining(now, expiry));
    }
    if wait.is_zero() {
        RenewalPlan::Renew
    } else {
        RenewalPlan::Wait(wait)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Keep the current token, try again later.
    Retry { retry_in: Duration },
    /// The credential is gone or renewal gave up.
    Invalidate,
}

/// Decides what a failed issuance means. `failures` includes the current one.
pub fn on_issuance_failure(
    now: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    failures: u32,
    settings: &RenewalSettings,
    backoff: &Backoff,
) -> FailureOutcome {
    let settings = settings.clamped();
    let remaining = expiry.map(|expiry| remaining(now, expiry));
    if remaining == Some(Duration::ZERO) {
        return FailureOutcome::Invalidate;
    }
    if failures >= settings.max_failures
        && remaining.map_or(true, |remaining| remaining < settings.renew_before)
    {
        return FailureOutcome::Invalidate;
    }
    let delay = backoff.delay_for(failures.saturating_sub(1));
    FailureOutcome::Retry {
        retry_in: remaining.map_or(delay, |remaining| delay.min(remaining)),
    }
}

pub struct IssuedToken {
    pub token: SecretString,
    pub expiry: DateTime<Utc>,
}

/// Obtains short-lived bearer tokens from a remote cluster.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, validity: Duration) -> anyhow::Result<IssuedToken>;
}

/// Issues tokens for a dedicated service account bound to `cluster-admin`,
/// creating it when missing.
pub struct ServiceAccountTokenIssuer {
    client: kube::Client,
    namespace: String,
    service_account: String,
}

impl ServiceAccountTokenIssuer {
    pub fn new(client: kube::Client, namespace: &str, service_account: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            service_account: service_account.to_owned(),
        }
    }

    async fn ensure_service_account(&self) -> Result<(), kube::Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Api::<Namespace>::all(self.client.clone())
            .patch(
                &self.namespace,
                &params,
                &Patch::Apply(json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "name": self.namespace },
                })),
            )
            .await?;
        Api::<ServiceAccount>::namespaced(self.client.clone(), &self.namespace)
            .patch(
                &self.service_account,
                &params,
                &Patch::Apply(json!({
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": { "name": self.service_account, "namespace": self.namespace },
                })),
            )
            .await?;
        Api::<ClusterRoleBinding>::all(self.client.clone())
            .patch(
                &self.service_account,
                &params,
                &Patch::Apply(json!({
                    "apiVersion": "rbac.authorization.k8s.io/v1",
                    "kind": "ClusterRoleBinding",
                    "metadata": { "name": self.service_account },
                    "roleRef": {
                        "apiGroup": "rbac.authorization.k8s.io",
                        "kind": "ClusterRole",
                        "name": "cluster-admin",
                    },
                    "subjects": [{
                        "kind": "ServiceAccount",
                        "name": self.service_account,
                        "namespace": self.namespace,
                    }],
                })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenIssuer for ServiceAccountTokenIssuer {
    async fn issue(&self, validity: Duration) -> anyhow::Result<IssuedToken> {
        self.ensure_service_account().await?;
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(i64::try_from(validity.as_secs()).unwrap_or(i64::MAX)),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = Api::<ServiceAccount>::namespaced(self.client.clone(), &self.namespace)
            .create_token_request(&self.service_account, &PostParams::default(), &request)
            .await?;
        let status = response
            .status
            .ok_or_else(|| anyhow!("token request returned no token"))?;
        Ok(IssuedToken {
            token: SecretString::new(status.token),
            expiry: status.expiration_timestamp.0,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed issuing token: {0:#}")]
    Issue(anyhow::Error),

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),
}

pub struct Renewal {
    pub kubeconfig: Kubeconfig,
    pub expiry: DateTime<Utc>,
}

/// Issues a fresh token and wraps it in a kubeconfig pointing at the same
/// API server as `source`.
pub async fn renew(
    issuer: &dyn TokenIssuer,
    source: &Kubeconfig,
    cluster_name: &str,
    settings: &RenewalSettings,
) -> Result<Renewal, CredentialError> {
    let issued = issuer
        .issue(settings.token_validity)
        .await
        .map_err(CredentialError::Issue)?;
    Ok(Renewal {
        kubeconfig: kubeconfig::token_kubeconfig(source, cluster_name, issued.token)?,
        expiry: issued.expiry,
    })
}

struct Credentials {
    ctx: Context,
    backoff: Backoff,
}

/// Keeps the operator-managed credential of every usable cluster fresh.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    info!("Starting cluster credential controller");
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<Cluster>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default().fields(&format!("type={SECRET_TYPE_KUBECONFIG}")),
            |secret: Secret| {
                secret
                    .namespace()
                    .map(|ns| ObjectRef::new(&secret.name_any()).within(&ns))
            },
        )
        .with_config(ctx.controller_config())
        .run(
            reconcile,
            |cluster, err, state| error_policy(CONTROLLER, &state.backoff, cluster.as_ref(), err),
            Arc::new(Credentials {
                backoff: ctx.backoff(),
                ctx,
            }),
        );
    drain(CONTROLLER, controller).await;
    Ok(())
}

async fn reconcile(cluster: Arc<Cluster>, state: Arc<Credentials>) -> ReconcileResult<Action> {
    let object = ObjectId::of(cluster.as_ref());
    observe(
        CONTROLLER,
        &state.backoff,
        &object,
        refresh(&cluster, &state.ctx, &state.backoff, &object),
    )
    .await
}

#[tracing::instrument(skip_all, fields(%object))]
async fn refresh(
    cluster: &Cluster,
    ctx: &Context,
    backoff: &Backoff,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    if cluster.is_terminating() || !cluster.is_reachable() {
        return Ok(Action::await_change());
    }
    let settings = RenewalSettings::from(&ctx.config.credentials).clamped();
    let now = Utc::now();
    if let RenewalPlan::Wait(remaining) =
        plan_attempt(now, cluster.status.as_ref(), &settings, backoff)
    {
        return Ok(Action::requeue(remaining));
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let secrets = Api::<Secret>::namespaced(ctx.client.clone(), &namespace);
    let secret = secrets
        .get_opt(&name)
        .await
        .transient(object, "read kubeconfig secret")?
        .ok_or_else(|| anyhow!("kubeconfig secret {namespace}/{name} not found"))
        .reconcile_err(ErrorKind::Credential, object, "read kubeconfig secret")?;
    let source = kubeconfig::source_kubeconfig(&secret).reconcile_err(
        ErrorKind::Credential,
        object,
        "read kubeconfig secret",
    )?;

    let timeout = ctx.remote_timeout();
    let renewal = issue_renewal(ctx, &namespace, &name, &source, &settings).await;

    let clusters = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace);
    let mut status = cluster.status.clone().unwrap_or_default();
    let action = match renewal {
        Ok(renewal) => {
            TOKEN_RENEWALS.with_label_values(&["success"]).inc();
            store_renewal(ctx, &secrets, &namespace, &name, &renewal, timeout, object).await?;
            renewed_status(&mut status, now, renewal.expiry);
            info!(expiry = %renewal.expiry, "renewed cluster credential");
            Action::requeue(settings.refresh_interval())
        }
        Err(err) => {
            TOKEN_RENEWALS.with_label_values(&["failure"]).inc();
            let failures = status.renewal_failures.saturating_add(1);
            let outcome =
                on_issuance_failure(now, cluster.bearer_token_expiry(), failures, &settings, backoff);
            warn!(failures, ?outcome, "credential renewal failed: {err}");
            failed_status(&mut status, now, failures, &outcome, &err);
            match outcome {
                FailureOutcome::Retry { retry_in } => Action::requeue(retry_in),
                FailureOutcome::Invalidate => {
                    ctx.tracker.remove(&namespace, &name).await;
                    Action::await_change()
                }
            }
        }
    };

    patch_status(&clusters, &name, &status)
        .await
        .transient(object, "update cluster status")?;
    Ok(action)
}

async fn issue_renewal(
    ctx: &Context,
    namespace: &str,
    name: &str,
    source: &Kubeconfig,
    settings: &RenewalSettings,
) -> Result<Renewal, CredentialError> {
    let timeout = ctx.remote_timeout();
    let remote = RemoteCluster::from_kubeconfig(namespace, name, source.clone(), timeout).await?;
    let issuer = ServiceAccountTokenIssuer::new(
        remote.client,
        &ctx.config.credentials.remote_namespace,
        &ctx.config.credentials.remote_service_account,
    );
    tokio::time::timeout(timeout, renew(&issuer, source, name, settings))
        .await
        .map_err(|_| CredentialError::Issue(anyhow!("timed out after {timeout:?}")))?
}

async fn store_renewal(
    ctx: &Context,
    secrets: &Api<Secret>,
    namespace: &str,
    name: &str,
    renewal: &Renewal,
    timeout: Duration,
    object: &ObjectId,
) -> ReconcileResult<()> {
    let yaml = kubeconfig::to_yaml(&renewal.kubeconfig).reconcile_err(
        ErrorKind::Credential,
        object,
        "serialize kubeconfig",
    )?;
    let patch = json!({
        "data": {
            GREENHOUSE_KUBECONFIG_KEY: ByteString(yaml.into_bytes()),
        }
    });
    secrets
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .transient(object, "store kubeconfig")?;

    let remote =
        RemoteCluster::from_kubeconfig(namespace, name, renewal.kubeconfig.clone(), timeout)
            .await
            .reconcile_err(ErrorKind::Credential, object, "refresh cluster client")?;
    ctx.tracker.insert(remote).await;
    Ok(())
}

fn renewed_status(status: &mut ClusterStatus, now: DateTime<Utc>, expiry: DateTime<Utc>) {
    status.access_state = ClusterAccessState::Ready;
    status.bearer_token_expiration_timestamp = Some(expiry);
    status.last_renewal_timestamp = Some(now);
    status.last_renewal_attempt = Some(now);
    status.renewal_failures = 0;
    status
        .status_conditions
        .set(Condition::new(ConditionType::Ready, true));
}

fn failed_status(
    status: &mut ClusterStatus,
    now: DateTime<Utc>,
    failures: u32,
    outcome: &FailureOutcome,
    err: &CredentialError,
) {
    status.last_renewal_attempt = Some(now);
    status.renewal_failures = failures;
    match outcome {
        FailureOutcome::Retry { .. } => {
            status.access_state = ClusterAccessState::Expiring;
            status.status_conditions.set(
                Condition::new(ConditionType::Ready, true)
                    .with_reason("TokenRenewalFailed")
                    .with_message(format!("renewal failed {failures} times: {err}")),
            );
        }
        FailureOutcome::Invalidate => {
            status.access_state = ClusterAccessState::Invalid;
            status.status_conditions.set(
                Condition::new(ConditionType::Ready, false)
                    .with_reason("CredentialExpired")
                    .with_message(format!("renewal failed {failures} times: {err}")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::kubeconfig::tests::USER_KUBECONFIG;
    use greenhouse_apis::kubeconfig::current_cluster;
    use greenhouse_apis::well_known::KUBECONFIG_KEY;
    use secrecy::ExposeSecret;

    const HOUR: Duration = Duration::from_secs(3600);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn settings(validity_hours: u64, renew_before_hours: u64) -> RenewalSettings {
        RenewalSettings {
            token_validity: HOUR * validity_hours as u32,
            renew_before: HOUR * renew_before_hours as u32,
            max_failures: 5,
        }
    }

    fn in_hours(hours: i64) -> Option<DateTime<Utc>> {
        Some(now() + chrono::Duration::hours(hours))
    }

    #[test]
    fn renew_before_is_capped_at_half_the_validity() {
        assert_eq!(clamp_renew_before(HOUR * 72, HOUR * 48), HOUR * 36);
        assert_eq!(clamp_renew_before(HOUR * 72, HOUR * 100), HOUR * 36);
        assert_eq!(clamp_renew_before(HOUR * 72, HOUR * 12), HOUR * 12);
        assert_eq!(settings(72, 48).clamped().refresh_interval(), HOUR * 36);
    }

    #[test]
    fn clamp_applies_before_deciding() {
        // Unclamped, 5h lead time would renew a token with 3h left.
        let plan = plan_renewal(now(), in_hours(3), &settings(4, 5));
        assert_eq!(plan, RenewalPlan::Wait(HOUR));
    }

    #[test]
    fn waits_while_far_from_expiry() {
        assert_eq!(
            plan_renewal(now(), in_hours(40), &settings(72, 24)),
            RenewalPlan::Wait(HOUR * 16)
        );
    }

    #[test]
    fn renews_when_due_or_unknown() {
        assert_eq!(
            plan_renewal(now(), in_hours(10), &settings(72, 24)),
            RenewalPlan::Renew
        );
        assert_eq!(
            plan_renewal(now(), in_hours(-1), &settings(72, 24)),
            RenewalPlan::Renew
        );
        assert_eq!(plan_renewal(now(), None, &settings(72, 24)), RenewalPlan::Renew);
    }

    #[test]
    fn failures_back_off_within_remaining_lifetime() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(
            on_issuance_failure(now(), in_hours(10), 1, &settings(72, 24), &backoff),
            FailureOutcome::Retry {
                retry_in: Duration::from_secs(5)
            }
        );
        assert_eq!(
            on_issuance_failure(now(), in_hours(10), 3, &settings(72, 24), &backoff),
            FailureOutcome::Retry {
                retry_in: Duration::from_secs(20)
            }
        );
        let soon = Some(now() + chrono::Duration::seconds(7));
        assert_eq!(
            on_issuance_failure(now(), soon, 4, &settings(72, 24), &backoff),
            FailureOutcome::Retry {
                retry_in: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn lapsed_or_exhausted_credentials_are_invalidated() {
        let backoff = Backoff::default();
        assert_eq!(
            on_issuance_failure(now(), in_hours(-1), 1, &settings(72, 24), &backoff),
            FailureOutcome::Invalidate
        );
        assert_eq!(
            on_issuance_failure(now(), in_hours(10), 5, &settings(72, 24), &backoff),
            FailureOutcome::Invalidate
        );
    }

    fn failed(failures: u32, attempt_secs_ago: i64, expiry: Option<DateTime<Utc>>) -> ClusterStatus {
        ClusterStatus {
            access_state: ClusterAccessState::Expiring,
            bearer_token_expiration_timestamp: expiry,
            last_renewal_attempt: Some(now() - chrono::Duration::seconds(attempt_secs_ago)),
            renewal_failures: failures,
            ..Default::default()
        }
    }

    #[test]
    fn retry_waits_out_backoff_from_last_attempt() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let status = failed(2, 1, in_hours(10));
        assert_eq!(
            plan_attempt(now(), Some(&status), &settings(72, 24), &backoff),
            RenewalPlan::Wait(Duration::from_secs(9))
        );

        let status = failed(2, 10, in_hours(10));
        assert_eq!(
            plan_attempt(now(), Some(&status), &settings(72, 24), &backoff),
            RenewalPlan::Renew
        );
    }

    #[test]
    fn retry_gate_ends_at_expiry() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let soon = Some(now() + chrono::Duration::seconds(3));
        assert_eq!(
            plan_attempt(now(), Some(&failed(4, 1, soon)), &settings(72, 24), &backoff),
            RenewalPlan::Wait(Duration::from_secs(3))
        );
        assert_eq!(
            plan_attempt(now(), Some(&failed(4, 1, in_hours(-1))), &settings(72, 24), &backoff),
            RenewalPlan::Renew
        );
    }

    #[test]
    fn first_attempt_is_not_gated() {
        let backoff = Backoff::default();
        let mut status = failed(0, 1, in_hours(10));
        status.last_renewal_attempt = Some(now());
        assert_eq!(
            plan_attempt(now(), Some(&status), &settings(72, 24), &backoff),
            RenewalPlan::Renew
        );
        assert_eq!(
            plan_attempt(now(), None, &settings(72, 24), &backoff),
            RenewalPlan::Renew
        );
        // Far from expiry the regular schedule applies regardless of failures.
        assert_eq!(
            plan_attempt(now(), Some(&failed(3, 1, in_hours(40))), &settings(72, 24), &backoff),
            RenewalPlan::Wait(HOUR * 16)
        );
    }

    struct FakeIssuer {
        result: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl TokenIssuer for FakeIssuer {
        async fn issue(&self, validity: Duration) -> anyhow::Result<IssuedToken> {
            assert_eq!(validity, HOUR * 72);
            match self.result {
                Ok(token) => Ok(IssuedToken {
                    token: SecretString::new(token.to_owned()),
                    expiry: now() + chrono::Duration::hours(72),
                }),
                Err(message) => Err(anyhow!(message)),
            }
        }
    }

    #[tokio::test]
    async fn renewal_swaps_token_and_keeps_server() {
        let source = kubeconfig::parse(KUBECONFIG_KEY, USER_KUBECONFIG.as_bytes()).unwrap();
        let issuer = FakeIssuer { result: Ok("fresh") };

        let renewal = renew(&issuer, &source, "c1", &settings(72, 48))
            .await
            .unwrap();

        assert_eq!(renewal.expiry, now() + chrono::Duration::hours(72));
        let cluster = current_cluster(&renewal.kubeconfig)
            .and_then(|named| named.cluster.clone())
            .unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://remote.example.com:6443"));
        let token = renewal.kubeconfig.auth_infos[0]
            .auth_info
            .as_ref()
            .and_then(|auth| auth.token.as_ref())
            .unwrap();
        assert_eq!(token.expose_secret(), "fresh");
    }

    #[tokio::test]
    async fn issuance_errors_surface() {
        let source = kubeconfig::parse(KUBECONFIG_KEY, USER_KUBECONFIG.as_bytes()).unwrap();
        let issuer = FakeIssuer {
            result: Err("forbidden"),
        };
        let err = renew(&issuer, &source, "c1", &settings(72, 48))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Failed issuing token: forbidden");
    }

    #[test]
    fn status_transitions() {
        let mut status = ClusterStatus {
            access_state: ClusterAccessState::Ready,
            renewal_failures: 0,
            ..Default::default()
        };
        let err = CredentialError::Issue(anyhow!("forbidden"));

        failed_status(
            &mut status,
            now(),
            1,
            &FailureOutcome::Retry {
                retry_in: Duration::from_secs(5),
            },
            &err,
        );
        assert_eq!(status.access_state, ClusterAccessState::Expiring);
        assert_eq!(status.renewal_failures, 1);
        assert_eq!(status.last_renewal_attempt, Some(now()));

        failed_status(&mut status, now(), 5, &FailureOutcome::Invalidate, &err);
        assert_eq!(status.access_state, ClusterAccessState::Invalid);
        let ready = status.status_conditions.get(ConditionType::Ready).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("CredentialExpired"));

        renewed_status(&mut status, now(), now() + chrono::Duration::hours(72));
        assert_eq!(status.access_state, ClusterAccessState::Ready);
        assert_eq!(status.renewal_failures, 0);
        assert_eq!(status.last_renewal_timestamp, Some(now()));
    }
}
