//! Structural validation of client configurations stored in cluster secrets.
//!
//! Errors describe which part of the configuration is broken without
//! repeating anything from it, entry names included.

use kube::config::{Kubeconfig, NamedCluster};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KubeconfigProblem {
    #[error("must not be empty")]
    Empty,

    #[error("is not valid UTF-8")]
    NotUtf8,

    #[error("could not be parsed as a client configuration")]
    Unparseable,

    #[error("has no current context")]
    NoCurrentContext,

    #[error("current context not found")]
    ContextNotFound,

    #[error("current context references an unknown cluster")]
    ClusterNotFound,

    #[error("current cluster has no server")]
    MissingServer,

    #[error("current cluster has an invalid server URL")]
    InvalidServer,

    #[error("current context references an unknown user")]
    UserNotFound,
}

/// Parses the given bytes and confirms the current context resolves to a
/// cluster with a server and to a user. No connection is attempted.
pub fn parse_usable(bytes: &[u8]) -> Result<Kubeconfig, KubeconfigProblem> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(KubeconfigProblem::Empty);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| KubeconfigProblem::NotUtf8)?;
    let kubeconfig = Kubeconfig::from_yaml(text).map_err(|_| KubeconfigProblem::Unparseable)?;
    confirm_usable(&kubeconfig)?;
    Ok(kubeconfig)
}

pub fn confirm_usable(kubeconfig: &Kubeconfig) -> Result<(), KubeconfigProblem> {
    let current = kubeconfig
        .current_context
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(KubeconfigProblem::NoCurrentContext)?;

    let context = kubeconfig
        .contexts
        .iter()
        .find(|ctx| ctx.name == current)
        .and_then(|ctx| ctx.context.as_ref())
        .ok_or(KubeconfigProblem::ContextNotFound)?;

    let cluster = current_cluster(kubeconfig)
        .and_then(|cluster| cluster.cluster.as_ref())
        .ok_or(KubeconfigProblem::ClusterNotFound)?;

    let server = cluster
        .server
        .as_deref()
        .filter(|server| !server.is_empty())
        .ok_or(KubeconfigProblem::MissingServer)?;
    url::Url::parse(server).map_err(|_| KubeconfigProblem::InvalidServer)?;

    if !kubeconfig
        .auth_infos
        .iter()
        .any(|user| user.name == context.user && user.auth_info.is_some())
    {
        return Err(KubeconfigProblem::UserNotFound);
    }

    Ok(())
}

/// The cluster entry referenced by the current context, if any.
pub fn current_cluster(kubeconfig: &Kubeconfig) -> Option<&NamedCluster> {
    let current = kubeconfig.current_context.as_deref()?;
    let context = kubeconfig
        .contexts
        .iter()
        .find(|ctx| ctx.name == current)?
        .context
        .as_ref()?;
    kubeconfig
        .clusters
        .iter()
        .find(|cluster| cluster.name == context.cluster)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const VALID: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example.com:6443
    certificate-authority-data: Zm9vCg==
contexts:
- name: remote
  context:
    cluster: remote
    user: admin
current-context: remote
users:
- name: admin
  user:
    token: s3cr3t-token
"#;

    #[test]
    fn accepts_valid_config() {
        let kubeconfig = parse_usable(VALID.as_bytes()).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("remote"));
        assert_eq!(current_cluster(&kubeconfig).unwrap().name, "remote");
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!(parse_usable(b""), Err(KubeconfigProblem::Empty));
        assert_eq!(parse_usable(b"  \n\t"), Err(KubeconfigProblem::Empty));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            parse_usable(b"this is: [not a kubeconfig"),
            Err(KubeconfigProblem::Unparseable)
        );
        assert_eq!(parse_usable(&[0xff, 0xfe, 0x00]), Err(KubeconfigProblem::NotUtf8));
    }

    #[test]
    fn rejects_missing_current_context() {
        let text = VALID.replace("current-context: remote", "");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::NoCurrentContext)
        );
    }

    #[test]
    fn rejects_dangling_references() {
        let text = VALID.replace("current-context: remote", "current-context: other");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::ContextNotFound)
        );

        let text = VALID.replace("    cluster: remote", "    cluster: nowhere");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::ClusterNotFound)
        );

        let text = VALID.replace("    user: admin", "    user: nobody");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::UserNotFound)
        );
    }

    #[test]
    fn rejects_bad_server() {
        let text = VALID.replace("https://remote.example.com:6443", "not a url");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::InvalidServer)
        );

        let text = VALID.replace("    server: https://remote.example.com:6443\n", "");
        assert_eq!(
            parse_usable(text.as_bytes()),
            Err(KubeconfigProblem::MissingServer)
        );
    }

    #[test]
    fn problems_do_not_echo_content() {
        let text = VALID.replace("current-context: remote", "current-context: [");
        let err = parse_usable(text.as_bytes()).unwrap_err();
        assert!(!err.to_string().contains("s3cr3t-token"));
        assert!(!err.to_string().contains("remote.example.com"));
    }

    #[test]
    fn problems_do_not_echo_entry_names() {
        const MARKER: &str = "leaked-marker";
        let broken = [
            VALID.replace("current-context: remote", &format!("current-context: {MARKER}")),
            VALID.replace("    cluster: remote", &format!("    cluster: {MARKER}")),
            VALID.replace("    user: admin", &format!("    user: {MARKER}")),
            VALID
                .replace("- name: remote\n  cluster:", &format!("- name: {MARKER}\n  cluster:"))
                .replace("    cluster: remote", &format!("    cluster: {MARKER}"))
                .replace("https://remote.example.com:6443", "not a url"),
        ];
        for text in broken {
            let err = parse_usable(text.as_bytes()).unwrap_err();
            assert!(!err.to_string().contains(MARKER), "{err}");
        }
    }
}
