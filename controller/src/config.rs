use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
pub struct Config {
    /// Turn debug logs on
    #[arg(long)]
    pub debug: bool,

    /// Controllers to run: `*` for all, a name to enable, `-name` to disable.
    #[arg(
        long,
        env = "GREENHOUSE_CONTROLLERS",
        default_value = "*",
        value_delimiter = ','
    )]
    pub controllers: Vec<String>,

    #[arg(long, env = "METRICS_PORT", default_value = "8080")]
    pub metrics_port: u16,

    #[clap(flatten)]
    pub runtime: RuntimeConfig,

    #[clap(flatten)]
    pub cluster: ClusterConfig,

    #[clap(flatten)]
    pub credentials: CredentialConfig,

    #[clap(flatten)]
    pub plugins: PluginConfig,
}

#[derive(Debug, Clone, clap::Args)]
#[group(skip)]
pub struct RuntimeConfig {
    /// Objects of one kind reconciled in parallel by each controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "4")]
    pub max_concurrent_reconciles: u16,

    /// Upper bound for every call to a remote cluster or to helm
    #[arg(long, env = "REMOTE_TIMEOUT", default_value = "30s")]
    pub remote_timeout: humantime::Duration,

    #[arg(long, env = "RETRY_BASE_DELAY", default_value = "5s")]
    pub retry_base_delay: humantime::Duration,

    #[arg(long, env = "RETRY_MAX_DELAY", default_value = "5m")]
    pub retry_max_delay: humantime::Duration,
}

#[derive(Debug, Clone, clap::Args)]
#[group(skip)]
pub struct ClusterConfig {
    /// Delay between marking a cluster for deletion and deleting it
    #[arg(long, env = "CLUSTER_DELETION_GRACE_PERIOD", default_value = "48h")]
    pub deletion_grace_period: humantime::Duration,

    /// How often registered clusters are probed for liveness
    #[arg(long, env = "CLUSTER_PROBE_INTERVAL", default_value = "5m")]
    pub probe_interval: humantime::Duration,
}

#[derive(Debug, Clone, clap::Args)]
#[group(skip)]
pub struct CredentialConfig {
    /// Lifetime of the tokens issued for remote clusters
    #[arg(long, env = "TOKEN_VALIDITY", default_value = "72h")]
    pub token_validity: humantime::Duration,

    /// How long before expiry a token is renewed. Capped at half the validity.
    #[arg(long, env = "RENEW_BEFORE", default_value = "48h")]
    pub renew_before: humantime::Duration,

    /// Consecutive renewal failures tolerated before a cluster is invalidated
    #[arg(long, env = "MAX_RENEWAL_FAILURES", default_value = "5")]
    pub max_renewal_failures: u32,

    /// Namespace holding the service account on remote clusters
    #[arg(long, env = "REMOTE_SERVICE_ACCOUNT_NAMESPACE", default_value = "greenhouse")]
    pub remote_namespace: String,

    #[arg(long, env = "REMOTE_SERVICE_ACCOUNT_NAME", default_value = "greenhouse")]
    pub remote_service_account: String,
}

#[derive(Debug, Clone, clap::Args)]
#[group(skip)]
pub struct PluginConfig {
    /// Injected into every release as `global.greenhouse.baseDomain`
    #[arg(long, env = "DNS_DOMAIN", default_value = "")]
    pub dns_domain: String,

    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    pub helm_binary: PathBuf,

    /// How often installed releases are checked for drift
    #[arg(long, env = "PLUGIN_RESYNC_INTERVAL", default_value = "10m")]
    pub resync_interval: humantime::Duration,
}

impl RuntimeConfig {
    pub fn remote_timeout(&self) -> Duration {
        self.remote_timeout.into()
    }
}
