use super::kubeconfig::{self, KubeconfigError};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::Kubeconfig;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Everything needed to talk to one remote cluster.
pub struct RemoteCluster {
    pub namespace: String,
    pub name: String,
    pub client: kube::Client,
    /// Serialized kubeconfig, handed to helm.
    pub kubeconfig: SecretString,
}

impl RemoteCluster {
    pub async fn from_kubeconfig(
        namespace: &str,
        name: &str,
        kubeconfig: Kubeconfig,
        timeout: Duration,
    ) -> Result<Self, KubeconfigError> {
        let yaml = kubeconfig::to_yaml(&kubeconfig)?;
        Ok(Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            client: kubeconfig::client_for(kubeconfig, timeout).await?,
            kubeconfig: SecretString::new(yaml),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("No kubeconfig secret for cluster {0}")]
    SecretNotFound(String),

    #[error("Failed reading kubeconfig secret: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),
}

/// Shared cache of remote cluster clients, keyed by `(namespace, name)`.
///
/// Entries are replaced as a whole. Callers hold an `Arc` snapshot, so a
/// refresh never disturbs operations already in flight.
#[derive(Clone, Default)]
pub struct ClusterTracker {
    clusters: Arc<RwLock<HashMap<(String, String), Arc<RemoteCluster>>>>,
}

impl ClusterTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Option<Arc<RemoteCluster>> {
        self.clusters
            .read()
            .await
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub async fn insert(&self, cluster: RemoteCluster) -> Arc<RemoteCluster> {
        let cluster = Arc::new(cluster);
        debug!(namespace = %cluster.namespace, name = %cluster.name, "tracking cluster");
        self.clusters.write().await.insert(
            (cluster.namespace.clone(), cluster.name.clone()),
            cluster.clone(),
        );
        cluster
    }

    pub async fn remove(&self, namespace: &str, name: &str) {
        debug!(%namespace, %name, "untracking cluster");
        self.clusters
            .write()
            .await
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    /// Returns the tracked client, loading it from the cluster's secret on a miss.
    #[tracing::instrument(err, skip_all, fields(%namespace, %name))]
    pub async fn get_or_load(
        &self,
        local: &kube::Client,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Arc<RemoteCluster>, TrackerError> {
        if let Some(cluster) = self.get(namespace, name).await {
            return Ok(cluster);
        }
        let secret = Api::<Secret>::namespaced(local.clone(), namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| TrackerError::SecretNotFound(format!("{namespace}/{name}")))?;
        let (key, bytes) = kubeconfig::candidates(&secret)
            .into_iter()
            .next()
            .ok_or(KubeconfigError::Missing)?;
        let kubeconfig = kubeconfig::parse(key, bytes)?;
        let cluster = RemoteCluster::from_kubeconfig(namespace, name, kubeconfig, timeout).await?;
        Ok(self.insert(cluster).await)
    }
}
