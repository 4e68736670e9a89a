//! mTLS certificate bootstrap and rustls configuration.
//!
//! Certificates live under a configurable directory: CA, server
//! cert/key and one shared node client cert/key. Missing files are
//! generated at first boot and must be kept on persistent storage. All
//! nodes present the same client certificate; node identity is
//! asserted by `NodeHello.node_id`.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;

use anyhow::{anyhow, Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::warn;

static INIT_CRYPTO: Once = Once::new();

/// Install the process-wide rustls crypto provider. Idempotent.
pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// File layout of the mTLS bundle inside the certificate directory.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl TlsPaths {
    pub fn under(cert_dir: &Path) -> Self {
        Self {
            ca_cert: cert_dir.join("ca.pem"),
            ca_key: cert_dir.join("ca.key"),
            server_cert: cert_dir.join("server.pem"),
            server_key: cert_dir.join("server.key"),
            client_cert: cert_dir.join("node-client.pem"),
            client_key: cert_dir.join("node-client.key"),
        }
    }
}

/// Ensure the full bundle exists under `cert_dir`, generating any
/// missing pieces. `server_name` is added to the server cert SANs so
/// nodes can dial the conductor by that name or address.
pub fn ensure_mtls_bundle(cert_dir: &Path, server_name: Option<&str>) -> Result<TlsPaths> {
    let paths = TlsPaths::under(cert_dir);
    fs::create_dir_all(cert_dir)
        .with_context(|| format!("creating cert dir {}", cert_dir.display()))?;

    let (ca_cert, ca_key) = ensure_ca(&paths)?;

    if !(paths.server_cert.exists() && paths.server_key.exists()) {
        warn!(path = %paths.server_cert.display(), "generating server certificate");
        let mut san_dns = vec!["localhost".to_string(), "symphony-conductor".to_string()];
        let mut san_ips = Vec::new();
        if let Some(name) = server_name {
            match name.parse::<std::net::IpAddr>() {
                Ok(ip) => san_ips.push(ip),
                Err(_) => san_dns.push(name.to_string()),
            }
        }
        generate_signed(
            &paths.server_cert,
            &paths.server_key,
            &ca_cert,
            &ca_key,
            server_name.unwrap_or("symphony-conductor"),
            &san_dns,
            &san_ips,
            ExtendedKeyUsagePurpose::ServerAuth,
        )?;
    }

    if !(paths.client_cert.exists() && paths.client_key.exists()) {
        warn!(path = %paths.client_cert.display(), "generating shared node client certificate");
        generate_signed(
            &paths.client_cert,
            &paths.client_key,
            &ca_cert,
            &ca_key,
            "symphony-node-shared",
            &["symphony-node".to_string()],
            &[],
            ExtendedKeyUsagePurpose::ClientAuth,
        )?;
    }

    Ok(paths)
}

/// Load or generate the CA, returning it ready to sign leaf certs.
fn ensure_ca(paths: &TlsPaths) -> Result<(rcgen::Certificate, KeyPair)> {
    if paths.ca_cert.exists() && paths.ca_key.exists() {
        let key_pem = fs::read_to_string(&paths.ca_key)?;
        let cert_pem = fs::read_to_string(&paths.ca_cert)?;
        let key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let cert = params.self_signed(&key)?;
        return Ok((cert, key));
    }

    warn!(path = %paths.ca_cert.display(), "generating CA certificate, valid for 10 years");

    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "symphony-ca");
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;

    fs::write(&paths.ca_key, key.serialize_pem())?;
    fs::write(&paths.ca_cert, cert.pem())?;
    Ok((cert, key))
}

#[allow(clippy::too_many_arguments)]
fn generate_signed(
    cert_path: &Path,
    key_path: &Path,
    ca_cert: &rcgen::Certificate,
    ca_key: &KeyPair,
    common_name: &str,
    san_dns: &[String],
    san_ips: &[std::net::IpAddr],
    purpose: ExtendedKeyUsagePurpose,
) -> Result<()> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);
    params.extended_key_usages.push(purpose);

    for name in san_dns {
        params
            .subject_alt_names
            .push(rcgen::SanType::DnsName(name.clone().try_into()?));
    }
    for ip in san_ips {
        params.subject_alt_names.push(rcgen::SanType::IpAddress(*ip));
    }

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, ca_cert, ca_key)?;

    fs::write(key_path, key.serialize_pem())?;
    fs::write(cert_path, cert.pem())?;
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        fs::File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
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

fn ca_root_store(ca_cert: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_cert)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server-side config: presents the server cert, requires a client
/// certificate chained to the CA.
pub fn server_config(paths: &TlsPaths) -> Result<Arc<ServerConfig>> {
    init_crypto_provider();
    let roots = ca_root_store(&paths.ca_cert)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| anyhow!("building client verifier: {e}"))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&paths.server_cert)?, load_key(&paths.server_key)?)?;
    Ok(Arc::new(config))
}

/// Client-side config for nodes: verifies the conductor against the CA
/// and presents the shared node client certificate.
pub fn client_config(ca_cert: &Path, client_cert: &Path, client_key: &Path) -> Result<Arc<ClientConfig>> {
    init_crypto_provider();
    let roots = ca_root_store(ca_cert)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(client_cert)?, load_key(client_key)?)?;
    Ok(Arc::new(config))
}

/// Parse the host part of `host:port` into a rustls server name.
pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name: {e}"))
}
