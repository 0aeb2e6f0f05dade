//! TLS termination for connections whose first bytes are a TLS record.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Load a PEM certificate chain and key into an acceptor.
///
/// ALPN advertises `h2` and `http/1.1` so HTTP clients can negotiate either.
pub async fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    Ok(TlsAcceptor::from(config.get_inner()))
}

/// Build the acceptor for an optional `[listener.tls]` section.
pub async fn acceptor_from_config(tls: Option<&TlsConfig>) -> Result<Option<TlsAcceptor>, std::io::Error> {
    match tls {
        Some(tls) => {
            let acceptor = load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            tracing::info!(cert_path = %tls.cert_path, "TLS termination enabled");
            Ok(Some(acceptor))
        }
        None => Ok(None),
    }
}
