//! Client-side TLS configuration for the conductor connection.
//!
//! Nodes load `ca.pem`, `node-client.pem` and `node-client.key` from
//! the certificate directory distributed from the conductor's bundle.
//! Missing files are an error — the node does not mint its own certs.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};

static INIT_CRYPTO: Once = Once::new();

/// Install the process-wide rustls crypto provider. Idempotent.
pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        fs::File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        fs::File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

/// Build the client config: verify the conductor against the CA and
/// present the shared node client certificate.
pub fn client_config(cert_dir: &Path) -> Result<Arc<ClientConfig>> {
    init_crypto_provider();

    let ca_path = cert_dir.join("ca.pem");
    let cert_path = cert_dir.join("node-client.pem");
    let key_path = cert_dir.join("node-client.key");
    for path in [&ca_path, &cert_path, &key_path] {
        if !path.exists() {
            bail!(
                "TLS file {} not found; copy the conductor's bundle into {}",
                path.display(),
                cert_dir.display()
            );
        }
    }

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&ca_path)? {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&cert_path)?, load_key(&key_path)?)?;
    Ok(Arc::new(config))
}

/// Server name for certificate verification, from the dialed host.
pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bundle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = client_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("ca.pem"));
    }

    #[test]
    fn server_names_parse() {
        assert!(server_name_for("localhost").is_ok());
        assert!(server_name_for("127.0.0.1").is_ok());
        assert!(server_name_for("conductor.example.com").is_ok());
    }
}
