use super::helm::{
    manifests_equal, CrdStore, HelmEngine, HelmError, LoadedChart, Release, ReleaseRequest,
    UninstallOutcome,
};
use super::values::changed_paths;
use crate::metrics::{result_label, HELM_OPERATIONS};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use secrecy::SecretString;
use tracing::{debug, info};

/// What has to happen for the deployed release to match the request.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleasePlan {
    Unchanged(Release),
    Install,
    Upgrade(Release),
}

impl ReleasePlan {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

/// One release on one remote cluster.
pub struct ReleaseTarget<'a> {
    pub engine: &'a dyn HelmEngine,
    pub crds: &'a dyn CrdStore,
    pub kubeconfig: &'a SecretString,
}

fn record<T>(operation: &str, result: &Result<T, HelmError>) {
    HELM_OPERATIONS
        .with_label_values(&[operation, result_label(result)])
        .inc();
}

impl ReleaseTarget<'_> {
    /// Compares the deployed release against the request without mutating
    /// anything on the cluster.
    #[tracing::instrument(err, skip_all, fields(release = %request.name, namespace = %request.namespace))]
    pub async fn plan(
        &self,
        chart: &LoadedChart,
        request: &ReleaseRequest,
    ) -> Result<ReleasePlan, HelmError> {
        let Some(deployed) = self
            .engine
            .get_release(self.kubeconfig, &request.namespace, &request.name)
            .await?
        else {
            return Ok(ReleasePlan::Install);
        };

        if !deployed.is_deployed() {
            debug!(status = %deployed.status, "release is not deployed");
            return Ok(ReleasePlan::Upgrade(deployed));
        }
        if deployed.chart_version != request.chart.version {
            debug!(
                deployed = %deployed.chart_version,
                requested = %request.chart.version,
                "chart version differs"
            );
            return Ok(ReleasePlan::Upgrade(deployed));
        }
        if deployed.values != request.values {
            debug!(
                paths = ?changed_paths(&deployed.values, &request.values),
                "values differ"
            );
            return Ok(ReleasePlan::Upgrade(deployed));
        }
        if !self.missing_crds(chart).await?.is_empty() {
            debug!("bundled CRDs missing");
            return Ok(ReleasePlan::Upgrade(deployed));
        }
        let rendered = self.render(request).await?;
        if !manifests_equal(&rendered, &deployed.manifest) {
            debug!("deployed manifest drifted");
            return Ok(ReleasePlan::Upgrade(deployed));
        }
        Ok(ReleasePlan::Unchanged(deployed))
    }

    /// Installs or upgrades according to the plan, creating missing bundled
    /// CRDs first. An unchanged plan is a no-op.
    #[tracing::instrument(err, skip_all, fields(release = %request.name, namespace = %request.namespace))]
    pub async fn apply(
        &self,
        chart: &LoadedChart,
        request: &ReleaseRequest,
        plan: ReleasePlan,
    ) -> Result<Release, HelmError> {
        let (operation, result) = match plan {
            ReleasePlan::Unchanged(release) => return Ok(release),
            ReleasePlan::Install => {
                self.ensure_crds(chart).await?;
                info!(chart = %request.chart.name, version = %request.chart.version, "installing release");
                ("install", self.engine.install(self.kubeconfig, request).await)
            }
            ReleasePlan::Upgrade(deployed) => {
                self.ensure_crds(chart).await?;
                info!(
                    chart = %request.chart.name,
                    version = %request.chart.version,
                    revision = deployed.revision,
                    "upgrading release"
                );
                ("upgrade", self.engine.upgrade(self.kubeconfig, request).await)
            }
        };
        record(operation, &result);
        result
    }

    /// Renders the release. CRDs are never touched.
    pub async fn render(&self, request: &ReleaseRequest) -> Result<String, HelmError> {
        let result = self.engine.template(self.kubeconfig, request).await;
        record("template", &result);
        result
    }

    #[tracing::instrument(err, skip(self))]
    pub async fn remove(&self, namespace: &str, name: &str) -> Result<UninstallOutcome, HelmError> {
        let result = self.engine.uninstall(self.kubeconfig, namespace, name).await;
        record("uninstall", &result);
        result
    }

    pub async fn missing_crds<'c>(
        &self,
        chart: &'c LoadedChart,
    ) -> Result<Vec<&'c CustomResourceDefinition>, HelmError> {
        let mut missing = Vec::new();
        for crd in &chart.crds {
            let name = crd.name_any();
            let exists = self
                .crds
                .exists(&name)
                .await
                .map_err(|source| HelmError::CrdLookup { name, source })?;
            if !exists {
                missing.push(crd);
            }
        }
        Ok(missing)
    }

    /// Creates every bundled CRD absent from the cluster. Existing CRDs are
    /// left alone.
    pub async fn ensure_crds(&self, chart: &LoadedChart) -> Result<usize, HelmError> {
        let missing = self.missing_crds(chart).await?;
        for crd in &missing {
            let name = crd.name_any();
            info!(crd = %name, "creating missing CRD");
            self.crds
                .create(crd)
                .await
                .map_err(|source| HelmError::CrdCreate { name, source })?;
        }
        Ok(missing.len())
    }
}
