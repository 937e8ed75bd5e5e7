use actix_web::middleware::Logger;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{anyhow, Context, Result};
use prometheus::Encoder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(clap::Args)]
#[group(skip)]
pub struct Config {
    #[arg(long, env = "WEBHOOK_PORT", default_value = "9443")]
    webhook_port: u16,

    /// PEM certificate chain presented to the API server. Without a
    /// certificate the webhook is served over plain HTTP.
    #[arg(long, env = "WEBHOOK_TLS_CERT_FILE", requires = "tls_key_file")]
    tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "WEBHOOK_TLS_KEY_FILE", requires = "tls_cert_file")]
    tls_key_file: Option<PathBuf>,
}

pub async fn serve(config: Config) -> Result<()> {
    let address = format!("0.0.0.0:{}", config.webhook_port);

    let server = HttpServer::new(|| {
        App::new()
            .wrap(Logger::default())
            .route("/healthz", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
            .configure(crate::routes::config)
    });

    let server = match (config.tls_cert_file, config.tls_key_file) {
        (Some(cert), Some(key)) => {
            info!("Serving admission webhooks over TLS on {address}");
            server.bind_rustls_0_23(&address, tls_config(&cert, &key)?)?
        }
        _ => {
            info!("Serving admission webhooks over plain HTTP on {address}");
            server.bind(&address)?
        }
    };

    Ok(server.run().await?)
}

fn tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_file).with_context(|| format!("Failed opening {}", cert_file.display()))?,
    ))
    .collect::<Result<Vec<CertificateDer<'static>>, _>>()
    .context("Failed reading webhook certificate chain")?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_file).with_context(|| format!("Failed opening {}", key_file.display()))?,
    ))
    .context("Failed reading webhook private key")?
    .ok_or_else(|| anyhow!("No private key found in {}", key_file.display()))?;

    Ok(rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?)
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
