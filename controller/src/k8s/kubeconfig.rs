use greenhouse_apis::kubeconfig::{current_cluster, parse_usable, KubeconfigProblem};
use greenhouse_apis::well_known::{GREENHOUSE_KUBECONFIG_KEY, KUBECONFIG_KEY};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{
    AuthInfo, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KubeconfigError {
    #[error("secret holds no kubeconfig")]
    Missing,

    #[error("{key} {problem}")]
    Invalid {
        key: &'static str,
        problem: KubeconfigProblem,
    },

    #[error("Failed loading client configuration: {0}")]
    Config(#[from] kube::config::KubeconfigError),

    #[error("Failed creating client: {0}")]
    Client(#[from] kube::Error),

    #[error("Failed serializing client configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Kubeconfigs stored in a cluster secret, operator-managed first.
pub fn candidates(secret: &Secret) -> Vec<(&'static str, &[u8])> {
    [GREENHOUSE_KUBECONFIG_KEY, KUBECONFIG_KEY]
        .into_iter()
        .filter_map(|key| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| (key, value.0.as_slice()))
        })
        .collect()
}

/// The user-provided kubeconfig if present, the operator-managed one otherwise.
/// Used as the source of truth for server address and CA when issuing tokens.
pub fn source_kubeconfig(secret: &Secret) -> Result<Kubeconfig, KubeconfigError> {
    let mut candidates = candidates(secret);
    candidates.reverse();
    let (key, bytes) = candidates
        .into_iter()
        .next()
        .ok_or(KubeconfigError::Missing)?;
    parse(key, bytes)
}

pub fn parse(key: &'static str, bytes: &[u8]) -> Result<Kubeconfig, KubeconfigError> {
    parse_usable(bytes).map_err(|problem| KubeconfigError::Invalid { key, problem })
}

pub async fn client_for(
    kubeconfig: Kubeconfig,
    timeout: Duration,
) -> Result<kube::Client, KubeconfigError> {
    let options = KubeConfigOptions {
        context: None,
        cluster: None,
        user: None,
    };
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    config.connect_timeout = Some(timeout);
    config.read_timeout = Some(timeout);
    config.write_timeout = Some(timeout);
    Ok(kube::Client::try_from(config)?)
}

/// A kubeconfig reaching the same API server as `source`, authenticating with
/// a bearer token.
pub fn token_kubeconfig(
    source: &Kubeconfig,
    cluster_name: &str,
    token: SecretString,
) -> Result<Kubeconfig, KubeconfigError> {
    let cluster = current_cluster(source)
        .and_then(|named| named.cluster.clone())
        .ok_or(KubeconfigError::Invalid {
            key: KUBECONFIG_KEY,
            problem: KubeconfigProblem::NoCurrentContext,
        })?;
    let user = "greenhouse";
    Ok(Kubeconfig {
        api_version: Some("v1".to_owned()),
        kind: Some("Config".to_owned()),
        clusters: vec![NamedCluster {
            name: cluster_name.to_owned(),
            cluster: Some(cluster),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: user.to_owned(),
            auth_info: Some(AuthInfo {
                token: Some(token),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: cluster_name.to_owned(),
            context: Some(Context {
                cluster: cluster_name.to_owned(),
                user: user.to_owned(),
                namespace: None,
                extensions: None,
            }),
        }],
        current_context: Some(cluster_name.to_owned()),
        ..Default::default()
    })
}

pub fn to_yaml(kubeconfig: &Kubeconfig) -> Result<String, KubeconfigError> {
    Ok(serde_yaml::to_string(kubeconfig)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use secrecy::ExposeSecret;

    pub(crate) const USER_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example.com:6443
    certificate-authority-data: Zm9vCg==
contexts:
- name: admin@remote
  context:
    cluster: remote
    user: admin
current-context: admin@remote
users:
- name: admin
  user:
    token: user-token
"#;

    pub(crate) fn secret_with(data: Vec<(&str, &str)>) -> Secret {
        let mut secret = Secret::default();
        secret.data = Some(
            data.into_iter()
                .map(|(k, v)| (k.to_owned(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret
    }

    #[test]
    fn operator_kubeconfig_is_preferred_for_clients() {
        let secret = secret_with(vec![
            (KUBECONFIG_KEY, USER_KUBECONFIG),
            (GREENHOUSE_KUBECONFIG_KEY, USER_KUBECONFIG),
        ]);
        let keys: Vec<_> = candidates(&secret).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![GREENHOUSE_KUBECONFIG_KEY, KUBECONFIG_KEY]);
    }

    #[test]
    fn source_falls_back_to_operator_kubeconfig() {
        let secret = secret_with(vec![(GREENHOUSE_KUBECONFIG_KEY, USER_KUBECONFIG)]);
        assert!(source_kubeconfig(&secret).is_ok());
        assert!(matches!(
            source_kubeconfig(&Secret::default()),
            Err(KubeconfigError::Missing)
        ));
    }

    #[test]
    fn token_kubeconfig_keeps_server_and_ca() {
        let source = parse(KUBECONFIG_KEY, USER_KUBECONFIG.as_bytes()).unwrap();
        let kubeconfig =
            token_kubeconfig(&source, "c1", SecretString::new("fresh".to_owned())).unwrap();

        assert!(greenhouse_apis::kubeconfig::confirm_usable(&kubeconfig).is_ok());
        let cluster = current_cluster(&kubeconfig)
            .and_then(|c| c.cluster.clone())
            .unwrap();
        assert_eq!(
            cluster.server.as_deref(),
            Some("https://remote.example.com:6443")
        );
        assert_eq!(cluster.certificate_authority_data.as_deref(), Some("Zm9vCg=="));

        let token = kubeconfig.auth_infos[0]
            .auth_info
            .as_ref()
            .and_then(|a| a.token.as_ref())
            .unwrap();
        assert_eq!(token.expose_secret(), "fresh");

        let yaml = to_yaml(&kubeconfig).unwrap();
        let reparsed = parse(GREENHOUSE_KUBECONFIG_KEY, yaml.as_bytes()).unwrap();
        assert_eq!(reparsed.current_context.as_deref(), Some("c1"));
    }
}
