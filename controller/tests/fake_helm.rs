use async_trait::async_trait;
use greenhouse_controller::plugin::helm::{
    ChartRef, CrdStore, HelmEngine, HelmError, LoadedChart, Release, ReleaseRequest,
    UninstallOutcome,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use secrecy::SecretString;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Ordered record of every call made to the fakes.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn mutations(log: &CallLog) -> Vec<String> {
    calls(log)
        .into_iter()
        .filter(|call| {
            ["install", "upgrade", "uninstall", "create crd"]
                .iter()
                .any(|prefix| call.starts_with(prefix))
        })
        .collect()
}

pub fn crd(name: &str) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A chart engine keeping releases in memory. The rendered manifest is
/// derived from the values, so value changes show up as drift.
pub struct FakeHelm {
    pub chart: LoadedChart,
    pub releases: Mutex<HashMap<(String, String), Release>>,
    pub log: CallLog,
}

impl FakeHelm {
    pub fn new(chart: LoadedChart, log: CallLog) -> Self {
        Self {
            chart,
            releases: Default::default(),
            log,
        }
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<Release> {
        self.releases
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }

    fn manifest(request: &ReleaseRequest) -> String {
        format!(
            "---\n# Source: {chart}/templates/config.yaml\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {namespace}\ndata:\n  values: '{values}'\n",
            chart = request.chart.name,
            name = request.name,
            namespace = request.namespace,
            values = serde_json::to_string(&request.values).unwrap(),
        )
    }

    fn store(&self, request: &ReleaseRequest) -> Release {
        let mut releases = self.releases.lock().unwrap();
        let key = (request.namespace.clone(), request.name.clone());
        let revision = releases.get(&key).map(|r| r.revision).unwrap_or(0) + 1;
        let release = Release {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            revision,
            status: "deployed".to_owned(),
            chart_version: request.chart.version.clone(),
            values: request.values.clone(),
            manifest: Self::manifest(request),
        };
        releases.insert(key, release.clone());
        release
    }
}

#[async_trait]
impl HelmEngine for FakeHelm {
    async fn load_chart(&self, chart: &ChartRef) -> Result<LoadedChart, HelmError> {
        self.record(format!("load {}", chart.name));
        Ok(self.chart.clone())
    }

    async fn get_release(
        &self,
        _kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, HelmError> {
        self.record(format!("status {namespace}/{name}"));
        Ok(self.release(namespace, name))
    }

    async fn install(
        &self,
        _kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError> {
        self.record(format!("install {}/{}", request.namespace, request.name));
        Ok(self.store(request))
    }

    async fn upgrade(
        &self,
        _kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError> {
        self.record(format!("upgrade {}/{}", request.namespace, request.name));
        Ok(self.store(request))
    }

    async fn template(
        &self,
        _kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<String, HelmError> {
        self.record(format!("template {}/{}", request.namespace, request.name));
        Ok(Self::manifest(request))
    }

    async fn uninstall(
        &self,
        _kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<UninstallOutcome, HelmError> {
        self.record(format!("uninstall {namespace}/{name}"));
        Ok(
            match self
                .releases
                .lock()
                .unwrap()
                .remove(&(namespace.to_owned(), name.to_owned()))
            {
                Some(_) => UninstallOutcome::Uninstalled,
                None => UninstallOutcome::NotFound,
            },
        )
    }
}

/// CRDs present on a fake remote cluster.
pub struct FakeCrds {
    pub existing: Mutex<BTreeSet<String>>,
    pub log: CallLog,
}

impl FakeCrds {
    pub fn new(log: CallLog) -> Self {
        Self {
            existing: Default::default(),
            log,
        }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.existing.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrdStore for FakeCrds {
    async fn exists(&self, name: &str) -> Result<bool, kube::Error> {
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), kube::Error> {
        self.log
            .lock()
            .unwrap()
            .push(format!("create crd {}", crd.name_any()));
        self.existing.lock().unwrap().insert(crd.name_any());
        Ok(())
    }
}
