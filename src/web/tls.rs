//! TLS termination: PEM loading and on-demand self-signed certificates.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use meshgen_config::ServerConfig;
use thiserror::Error;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;

/// Names the generated certificate is valid for.
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("failed to generate a self-signed certificate: {0}")]
    Generate(String),
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    if !path.is_file() {
        return Err(TlsConfigError::Missing(path.to_path_buf()));
    }
    fs::read(path).map_err(|source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &str) -> Result<(), TlsConfigError> {
    let io_err = |source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, contents).map_err(io_err)
}

/// Write a fresh self-signed pair unless both files already exist.
///
/// Returns `true` when a new pair was generated.
pub fn ensure_self_signed(cert_path: &Path, key_path: &Path) -> Result<bool, TlsConfigError> {
    if cert_path.is_file() && key_path.is_file() {
        return Ok(false);
    }
    let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|s| s.to_string()).collect();
    let cert = rcgen::generate_simple_self_signed(names).map_err(|e| TlsConfigError::Generate(e.to_string()))?;
    let cert_pem = cert.serialize_pem().map_err(|e| TlsConfigError::Generate(e.to_string()))?;
    write_file(cert_path, &cert_pem)?;
    write_file(key_path, &cert.serialize_private_key_pem())?;
    log::info!(
        target: "server",
        "Generated self-signed certificate at {} (key {})",
        cert_path.display(),
        key_path.display()
    );
    Ok(true)
}

pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>, TlsConfigError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice()).map_err(|source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// First PKCS#8 key, falling back to a PKCS#1 RSA key.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsConfigError> {
    let pem = read_file(path)?;
    let read_err = |source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice()).map_err(read_err)?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut pem.as_slice()).map_err(read_err)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsConfigError> {
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;
    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// `None` when TLS was not asked for. `--auto-ssl` generates missing files first.
pub fn resolve_tls(config: &ServerConfig) -> Result<Option<TlsAcceptor>, TlsConfigError> {
    if !config.tls_requested() {
        return Ok(None);
    }
    if config.auto_ssl {
        ensure_self_signed(&config.ssl_cert, &config.ssl_key)?;
    }
    load_acceptor(&config.ssl_cert, &config.ssl_key).map(Some)
}
