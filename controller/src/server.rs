use actix_web::middleware::Logger;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::Result;
use prometheus::Encoder;
use tracing::info;

/// Liveness and metrics endpoints.
pub async fn serve(port: u16) -> Result<()> {
    let address = format!("0.0.0.0:{port}");
    info!("Serving metrics on {address}");

    HttpServer::new(|| {
        App::new()
            .wrap(Logger::default())
            .route("/healthz", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
    })
    .bind(&address)?
    .run()
    .await?;
    Ok(())
}

async fn status() -> HttpResponse {
    HttpResponse::Ok().json("ok")
}

async fn metrics() -> HttpResponse {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(body) => HttpResponse::Ok().body(body),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    #[actix_web::test]
    async fn serves_health_and_metrics() {
        crate::metrics::RECONCILE_COUNTER
            .with_label_values(&["plugin", "success"])
            .inc();
        let app = test::init_service(
            App::new()
                .route("/healthz", web::get().to(status))
                .route("/metrics", web::get().to(metrics)),
        )
        .await;

        let response =
            test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
        assert!(response.status().is_success());

        let body = test::call_and_read_body(
            &app,
            test::TestRequest::get().uri("/metrics").to_request(),
        )
        .await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("greenhouse_reconcile_total"));
    }
}
