use crate::errors::{FieldError, GateError};
use greenhouse_apis::kubeconfig::parse_usable;
use greenhouse_apis::well_known::{
    GREENHOUSE_KUBECONFIG_KEY, KUBECONFIG_KEY, SECRET_TYPE_KUBECONFIG,
};
use k8s_openapi::api::core::v1::Secret;
use kube::core::admission::Operation;
use kube::ResourceExt;

const KUBECONFIG_KEYS: [&str; 2] = [KUBECONFIG_KEY, GREENHOUSE_KUBECONFIG_KEY];

pub fn is_kubeconfig_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(SECRET_TYPE_KUBECONFIG)
}

/// Admission check for secrets carrying cluster access configuration.
///
/// Other secret types and deletions are always allowed. A kubeconfig secret
/// needs at least one of the recognized keys, and every present key must hold
/// a parseable configuration with a usable current context.
pub fn validate_secret(operation: &Operation, secret: &Secret) -> Result<(), GateError> {
    if !matches!(operation, Operation::Create | Operation::Update) {
        return Ok(());
    }
    if !is_kubeconfig_secret(secret) {
        return Ok(());
    }

    let mut errors = Vec::new();
    let mut present = 0;
    for key in KUBECONFIG_KEYS {
        let Some(bytes) = secret_value(secret, key) else {
            continue;
        };
        present += 1;
        if let Err(problem) = parse_usable(bytes) {
            errors.push(FieldError::invalid(
                format!("data.{key}"),
                format!("{key} {problem}"),
            ));
        }
    }
    if present == 0 {
        errors.push(FieldError::required(format!("data.{KUBECONFIG_KEY}")));
    }

    match errors.is_empty() {
        true => Ok(()),
        false => Err(GateError::Invalid {
            kind: "Secret",
            name: secret.name_any(),
            errors,
        }),
    }
}

/// `stringData` wins over `data`, as it does when the API server persists the
/// object.
fn secret_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.as_bytes())
        .or_else(|| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.0.as_slice())
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::FieldErrorKind;
    use k8s_openapi::ByteString;
    use maplit::btreemap;

    pub(crate) const VALID: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example.com:6443
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

    pub(crate) fn kubeconfig_secret(data: Vec<(&str, &[u8])>) -> Secret {
        let mut secret = Secret {
            type_: Some(SECRET_TYPE_KUBECONFIG.to_owned()),
            ..Default::default()
        };
        secret.metadata.name = Some("remote".to_owned());
        secret.metadata.namespace = Some("org".to_owned());
        secret.data = Some(
            data.into_iter()
                .map(|(k, v)| (k.to_owned(), ByteString(v.to_vec())))
                .collect(),
        );
        secret
    }

    #[test]
    fn accepts_valid_user_kubeconfig() {
        let secret = kubeconfig_secret(vec![(KUBECONFIG_KEY, VALID.as_bytes())]);
        assert!(validate_secret(&Operation::Create, &secret).is_ok());
        assert!(validate_secret(&Operation::Update, &secret).is_ok());
    }

    #[test]
    fn accepts_operator_kubeconfig_alone() {
        let secret = kubeconfig_secret(vec![(GREENHOUSE_KUBECONFIG_KEY, VALID.as_bytes())]);
        assert!(validate_secret(&Operation::Create, &secret).is_ok());
    }

    #[test]
    fn rejects_secret_without_keys() {
        let secret = kubeconfig_secret(vec![("other", &b"x"[..])]);
        let err = validate_secret(&Operation::Create, &secret).unwrap_err();
        assert_eq!(
            err.field_errors(),
            &[FieldError::required("data.kubeconfig")]
        );
    }

    #[test]
    fn rejects_empty_value_with_field_path() {
        let secret = kubeconfig_secret(vec![
            (KUBECONFIG_KEY, VALID.as_bytes()),
            (GREENHOUSE_KUBECONFIG_KEY, &b""[..]),
        ]);
        let err = validate_secret(&Operation::Update, &secret).unwrap_err();
        let errors = err.field_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "data.greenhousekubeconfig");
        assert!(matches!(errors[0].kind, FieldErrorKind::Invalid(_)));
    }

    #[test]
    fn rejection_never_contains_payload() {
        let broken = VALID.replace("current-context: remote", "current-context: s3cr3t-token");
        let secret = kubeconfig_secret(vec![(KUBECONFIG_KEY, broken.as_bytes())]);
        let message = validate_secret(&Operation::Create, &secret)
            .unwrap_err()
            .to_string();
        assert!(message.contains("data.kubeconfig"));
        assert!(!message.contains("s3cr3t-token"));
        assert!(!message.contains("remote.example.com"));
    }

    #[test]
    fn string_data_is_validated() {
        let mut secret = kubeconfig_secret(vec![]);
        secret.string_data = Some(btreemap! {
            KUBECONFIG_KEY.to_owned() => "garbage: [".to_owned(),
        });
        assert!(validate_secret(&Operation::Create, &secret).is_err());
    }

    #[test]
    fn ignores_other_types_and_deletes() {
        let mut secret = kubeconfig_secret(vec![(KUBECONFIG_KEY, &b""[..])]);
        assert!(validate_secret(&Operation::Delete, &secret).is_ok());

        secret.type_ = Some("Opaque".to_owned());
        assert!(validate_secret(&Operation::Create, &secret).is_ok());
    }
}
