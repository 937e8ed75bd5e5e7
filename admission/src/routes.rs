use crate::errors::GateError;
use crate::metrics;
use crate::secret::validate_secret;
use actix_web::{web, HttpResponse};
use k8s_openapi::api::core::v1::Secret;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::response::{StatusCause, StatusDetails};
use tracing::{debug, info, warn};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("/validate--v1-secret", web::post().to(validate_secret_review))
        .route("/mutate--v1-secret", web::post().to(mutate_secret_review));
}

#[tracing::instrument(skip_all)]
async fn validate_secret_review(review: web::Json<AdmissionReview<Secret>>) -> HttpResponse {
    let request: AdmissionRequest<Secret> = match review.into_inner().try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!("Malformed admission review: {err}");
            return HttpResponse::Ok().json(AdmissionResponse::invalid(err).into_review());
        }
    };

    let operation = format!("{:?}", request.operation);
    let response = AdmissionResponse::from(&request);
    let object = request.object.as_ref().or(request.old_object.as_ref());

    let response = match object.map(|secret| validate_secret(&request.operation, secret)) {
        None | Some(Ok(())) => response,
        Some(Err(err)) => {
            info!(
                namespace = request.namespace.as_deref().unwrap_or_default(),
                name = %request.name,
                "Rejected secret: {err}"
            );
            deny_with_causes(response, &err)
        }
    };

    debug!(allowed = response.allowed, %operation);
    metrics::record("secrets", &operation, response.allowed);
    HttpResponse::Ok().json(response.into_review())
}

/// Secrets are never modified. The endpoint exists so the mutating webhook
/// registration has a target.
#[tracing::instrument(skip_all)]
async fn mutate_secret_review(review: web::Json<AdmissionReview<Secret>>) -> HttpResponse {
    let request: AdmissionRequest<Secret> = match review.into_inner().try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!("Malformed admission review: {err}");
            return HttpResponse::Ok().json(AdmissionResponse::invalid(err).into_review());
        }
    };
    HttpResponse::Ok().json(AdmissionResponse::from(&request).into_review())
}

fn deny_with_causes(response: AdmissionResponse, err: &GateError) -> AdmissionResponse {
    let mut response = response.deny(err);
    response.result.code = 422;
    response.result.reason = "Invalid".to_owned();
    response.result.details = Some(StatusDetails {
        name: String::new(),
        group: String::new(),
        kind: "Secret".to_owned(),
        uid: String::new(),
        causes: err
            .field_errors()
            .iter()
            .map(|field_error| StatusCause {
                reason: field_error.reason().to_owned(),
                message: field_error.detail(),
                field: field_error.field.clone(),
            })
            .collect(),
        retry_after_seconds: 0,
    });
    response
}
