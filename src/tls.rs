use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("no valid certificates found in '{0}'")]
    NoCerts(String),
    #[error("no valid private key found in '{0}'")]
    NoKey(String),
    #[error("failed to build TLS config: {0}")]
    RustlsConfig(#[from] rustls::Error),
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })
}

fn read_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let chain = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCerts(path.to_string()));
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey(path.to_string()))
}

/// Server config for the webhook listener from the serving certificate
/// mounted by the cluster's certificate issuer.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let chain = read_chain(cert_path)?;
    let key = read_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
