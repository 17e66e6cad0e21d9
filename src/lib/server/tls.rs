//! TLS acceptor construction from PEM cert and key files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{SserverError, SserverResult};

pub fn build_tls_acceptor(cert_file: &Path, key_file: &Path) -> SserverResult<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(SserverError::Config(format!(
            "no certificates in {}",
            cert_file.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| {
            SserverError::Config(format!("no private key in {}", key_file.display()))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_rejected() {
        let result = build_tls_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(result.is_err());
    }
}
