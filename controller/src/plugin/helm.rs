use async_trait::async_trait;
use greenhouse_apis::HelmChartReference;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

const OCI_PREFIX: &str = "oci://";

/// Where helm finds a chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRef {
    pub name: String,
    pub repo_url: Option<String>,
    pub version: String,
}

impl From<&HelmChartReference> for ChartRef {
    fn from(chart: &HelmChartReference) -> Self {
        if chart.repository.starts_with(OCI_PREFIX) {
            Self {
                name: format!("{}/{}", chart.repository.trim_end_matches('/'), chart.name),
                repo_url: None,
                version: chart.version.clone(),
            }
        } else {
            Self {
                name: chart.name.clone(),
                repo_url: Some(chart.repository.clone()).filter(|repo| !repo.is_empty()),
                version: chart.version.clone(),
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadedChart {
    pub default_values: Value,
    pub crds: Vec<CustomResourceDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub name: String,
    pub namespace: String,
    pub chart: ChartRef,
    pub values: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: i64,
    pub status: String,
    pub chart_version: String,
    pub values: Value,
    pub manifest: String,
}

impl Release {
    pub fn is_deployed(&self) -> bool {
        self.status == "deployed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UninstallOutcome {
    #[strum(serialize = "not found")]
    NotFound,
    #[strum(serialize = "uninstalled")]
    Uninstalled,
}

#[derive(Debug, thiserror::Error)]
pub enum HelmError {
    #[error("Failed running helm: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("helm {command} failed: {stderr}")]
    Command {
        command: &'static str,
        stderr: String,
    },

    #[error("Failed parsing helm output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed parsing helm output: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed looking up CRD {name}: {source}")]
    CrdLookup { name: String, source: kube::Error },

    #[error("Failed creating CRD {name}: {source}")]
    CrdCreate { name: String, source: kube::Error },
}

/// The chart engine. Every call touching a cluster gets its kubeconfig
/// explicitly.
#[async_trait]
pub trait HelmEngine: Send + Sync {
    async fn load_chart(&self, chart: &ChartRef) -> Result<LoadedChart, HelmError>;

    async fn get_release(
        &self,
        kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, HelmError>;

    async fn install(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError>;

    async fn upgrade(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError>;

    /// Renders the release manifest without touching the cluster state.
    async fn template(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<String, HelmError>;

    async fn uninstall(
        &self,
        kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<UninstallOutcome, HelmError>;
}

/// CustomResourceDefinitions on a remote cluster.
#[async_trait]
pub trait CrdStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, kube::Error>;

    /// Creates the CRD. One that appeared in the meantime is not an error.
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), kube::Error>;
}

pub struct KubeCrdStore {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdStore for KubeCrdStore {
    async fn exists(&self, name: &str) -> Result<bool, kube::Error> {
        Ok(self.api.get_opt(name).await?.is_some())
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), kube::Error> {
        match self.api.create(&PostParams::default(), crd).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Drives the `helm` binary. Each call gets its own kubeconfig and values
/// files, removed when the call returns.
pub struct HelmCli {
    binary: PathBuf,
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    version: i64,
    info: HelmReleaseInfo,
    chart: HelmChart,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    manifest: String,
}

#[derive(Deserialize)]
struct HelmReleaseInfo {
    status: String,
}

#[derive(Deserialize)]
struct HelmChart {
    metadata: HelmChartMetadata,
}

#[derive(Deserialize)]
struct HelmChartMetadata {
    version: String,
}

impl From<HelmRelease> for Release {
    fn from(release: HelmRelease) -> Self {
        Self {
            name: release.name,
            namespace: release.namespace,
            revision: release.version,
            status: release.info.status,
            chart_version: release.chart.metadata.version,
            values: release
                .config
                .filter(|config| !config.is_null())
                .unwrap_or_else(|| Value::Object(Default::default())),
            manifest: release.manifest,
        }
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found")
}

fn temp_file(contents: &[u8]) -> Result<NamedTempFile, HelmError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(file)
}

fn chart_args(chart: &ChartRef) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![chart.name.clone().into()];
    if let Some(repo_url) = &chart.repo_url {
        args.push("--repo".into());
        args.push(repo_url.into());
    }
    if !chart.version.is_empty() {
        args.push("--version".into());
        args.push(chart.version.clone().into());
    }
    args
}

impl HelmCli {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(
        &self,
        command: &'static str,
        args: Vec<OsString>,
    ) -> Result<Result<String, String>, HelmError> {
        debug!(command, "running helm");
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Ok(if output.status.success() {
            Ok(stdout)
        } else {
            Err(stderr)
        })
    }

    async fn run_checked(
        &self,
        command: &'static str,
        args: Vec<OsString>,
    ) -> Result<String, HelmError> {
        self.run(command, args)
            .await?
            .map_err(|stderr| HelmError::Command { command, stderr })
    }

    async fn apply(
        &self,
        command: &'static str,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError> {
        let kubeconfig_file = temp_file(kubeconfig.expose_secret().as_bytes())?;
        let values_file = temp_file(serde_yaml::to_string(&request.values)?.as_bytes())?;

        let mut args: Vec<OsString> = vec![command.into(), request.name.clone().into()];
        args.extend(chart_args(&request.chart));
        let flags: [OsString; 10] = [
            "--namespace".into(),
            request.namespace.clone().into(),
            "--create-namespace".into(),
            "--skip-crds".into(),
            "--values".into(),
            values_file.path().into(),
            "--kubeconfig".into(),
            kubeconfig_file.path().into(),
            "--output".into(),
            "json".into(),
        ];
        args.extend(flags);
        let output = self.run_checked(command, args).await?;
        Ok(serde_json::from_str::<HelmRelease>(&output)?.into())
    }
}

#[async_trait]
impl HelmEngine for HelmCli {
    async fn load_chart(&self, chart: &ChartRef) -> Result<LoadedChart, HelmError> {
        let mut args: Vec<OsString> = vec!["show".into(), "values".into()];
        args.extend(chart_args(chart));
        let values = self.run_checked("show values", args).await?;
        let default_values = match serde_yaml::from_str::<Option<Value>>(&values)? {
            Some(values @ Value::Object(_)) => values,
            _ => Value::Object(Default::default()),
        };

        let mut args: Vec<OsString> = vec!["show".into(), "crds".into()];
        args.extend(chart_args(chart));
        let crds = parse_crds(&self.run_checked("show crds", args).await?)?;

        Ok(LoadedChart {
            default_values,
            crds,
        })
    }

    async fn get_release(
        &self,
        kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, HelmError> {
        let kubeconfig_file = temp_file(kubeconfig.expose_secret().as_bytes())?;
        let args: Vec<OsString> = vec![
            "status".into(),
            name.into(),
            "--namespace".into(),
            namespace.into(),
            "--kubeconfig".into(),
            kubeconfig_file.path().into(),
            "--output".into(),
            "json".into(),
        ];
        match self.run("status", args).await? {
            Ok(output) => Ok(Some(serde_json::from_str::<HelmRelease>(&output)?.into())),
            Err(stderr) if is_not_found(&stderr) => Ok(None),
            Err(stderr) => Err(HelmError::Command {
                command: "status",
                stderr,
            }),
        }
    }

    async fn install(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError> {
        self.apply("install", kubeconfig, request).await
    }

    async fn upgrade(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<Release, HelmError> {
        self.apply("upgrade", kubeconfig, request).await
    }

    async fn template(
        &self,
        kubeconfig: &SecretString,
        request: &ReleaseRequest,
    ) -> Result<String, HelmError> {
        let kubeconfig_file = temp_file(kubeconfig.expose_secret().as_bytes())?;
        let values_file = temp_file(serde_yaml::to_string(&request.values)?.as_bytes())?;

        let mut args: Vec<OsString> = vec!["template".into(), request.name.clone().into()];
        args.extend(chart_args(&request.chart));
        let flags: [OsString; 7] = [
            "--namespace".into(),
            request.namespace.clone().into(),
            "--skip-crds".into(),
            "--values".into(),
            values_file.path().into(),
            "--kubeconfig".into(),
            kubeconfig_file.path().into(),
        ];
        args.extend(flags);
        self.run_checked("template", args).await
    }

    async fn uninstall(
        &self,
        kubeconfig: &SecretString,
        namespace: &str,
        name: &str,
    ) -> Result<UninstallOutcome, HelmError> {
        let kubeconfig_file = temp_file(kubeconfig.expose_secret().as_bytes())?;
        let args: Vec<OsString> = vec![
            "uninstall".into(),
            name.into(),
            "--namespace".into(),
            namespace.into(),
            "--kubeconfig".into(),
            kubeconfig_file.path().into(),
        ];
        match self.run("uninstall", args).await? {
            Ok(_) => Ok(UninstallOutcome::Uninstalled),
            Err(stderr) if is_not_found(&stderr) => Ok(UninstallOutcome::NotFound),
            Err(stderr) => Err(HelmError::Command {
                command: "uninstall",
                stderr,
            }),
        }
    }
}

fn yaml_documents(input: &str) -> Result<Vec<serde_yaml::Value>, serde_yaml::Error> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = serde_yaml::Value::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

pub fn parse_crds(input: &str) -> Result<Vec<CustomResourceDefinition>, HelmError> {
    Ok(yaml_documents(input)?
        .into_iter()
        .map(serde_yaml::from_value)
        .collect::<Result<_, _>>()?)
}

fn is_hook(document: &serde_yaml::Value) -> bool {
    document
        .get("metadata")
        .and_then(|metadata| metadata.get("annotations"))
        .and_then(|annotations| annotations.get("helm.sh/hook"))
        .is_some()
}

/// Compares two rendered manifests by their objects, ignoring document
/// order, formatting, comments and hooks.
pub fn manifests_equal(rendered: &str, deployed: &str) -> bool {
    fn normalize(manifest: &str) -> Option<Vec<String>> {
        let mut documents = yaml_documents(manifest)
            .ok()?
            .iter()
            .filter(|document| !is_hook(document))
            .map(|document| {
                serde_json::to_value(document)
                    .and_then(|value| serde_json::to_string(&value))
                    .ok()
            })
            .collect::<Option<Vec<_>>>()?;
        documents.sort();
        Some(documents)
    }
    match (normalize(rendered), normalize(deployed)) {
        (Some(rendered), Some(deployed)) => rendered == deployed,
        _ => false,
    }
}
