use crate::k8s::ClusterTracker;
use async_trait::async_trait;
use greenhouse_apis::well_known::FIELD_MANAGER;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;

/// Roles and RoleBindings on one remote cluster.
#[async_trait]
pub trait RbacTarget: Send + Sync {
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, kube::Error>;

    async fn apply_role(&self, role: &Role) -> Result<(), kube::Error>;

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, kube::Error>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), kube::Error>;

    /// Deleting a binding that does not exist succeeds.
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// Resolves remote clusters to RBAC targets.
#[async_trait]
pub trait RbacFleet: Send + Sync {
    async fn target(&self, namespace: &str, cluster: &str) -> anyhow::Result<Arc<dyn RbacTarget>>;
}

pub struct KubeRbacTarget {
    client: kube::Client,
}

impl KubeRbacTarget {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RbacTarget for KubeRbacTarget {
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, kube::Error> {
        Api::<Role>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn apply_role(&self, role: &Role) -> Result<(), kube::Error> {
        Api::<Role>::namespaced(self.client.clone(), &role.namespace().unwrap_or_default())
            .patch(
                &role.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(role),
            )
            .await?;
        Ok(())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, kube::Error> {
        Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), kube::Error> {
        Api::<RoleBinding>::namespaced(self.client.clone(), &binding.namespace().unwrap_or_default())
            .patch(
                &binding.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(binding),
            )
            .await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Targets backed by the shared cluster client cache.
pub struct TrackerFleet {
    local: kube::Client,
    tracker: ClusterTracker,
    timeout: Duration,
}

impl TrackerFleet {
    pub fn new(local: kube::Client, tracker: ClusterTracker, timeout: Duration) -> Self {
        Self {
            local,
            tracker,
            timeout,
        }
    }
}

#[async_trait]
impl RbacFleet for TrackerFleet {
    async fn target(&self, namespace: &str, cluster: &str) -> anyhow::Result<Arc<dyn RbacTarget>> {
        let remote = self
            .tracker
            .get_or_load(&self.local, namespace, cluster, self.timeout)
            .await?;
        Ok(Arc::new(KubeRbacTarget::new(remote.client.clone())))
    }
}
