//! TLS identities
//!
//! Certificates and keys are read from PEM files. When no identity is
//! configured a self-signed certificate is generated in memory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Validity of generated certificates
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Read every CERTIFICATE block of a PEM file
pub fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let data = fs::read(path)
        .map_err(|e| Error::Certificate(format!("failed to read {}: {}", path.display(), e)))?;
    let blocks = pem::parse_many(&data)
        .map_err(|e| Error::Certificate(format!("invalid PEM in {}: {}", path.display(), e)))?;

    let certs: Vec<CertificateDer<'static>> = blocks
        .iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.contents().to_vec()))
        .collect();
    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key of a PEM file (PKCS#8, PKCS#1 or SEC1)
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let data = fs::read(path)
        .map_err(|e| Error::Certificate(format!("failed to read {}: {}", path.display(), e)))?;
    let blocks = pem::parse_many(&data)
        .map_err(|e| Error::Certificate(format!("invalid PEM in {}: {}", path.display(), e)))?;

    for block in &blocks {
        let der = block.contents().to_vec();
        match block.tag() {
            "PRIVATE KEY" => return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
            "RSA PRIVATE KEY" => return Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
            "EC PRIVATE KEY" => return Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
            _ => {}
        }
    }
    Err(Error::Certificate(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Build a server config for one certificate chain
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Load a PEM certificate/key pair into a server config
pub fn load_identity<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&cert_path)?;
    let key = load_private_key(&key_path)?;
    debug!(
        "loaded TLS identity {} ({} certificates)",
        cert_path.as_ref().display(),
        certs.len()
    );
    server_config(certs, key)
}

/// Generated certificate and its key
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl SelfSigned {
    /// Generate a self-signed certificate for `common_name`
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(vec![common_name.to_string()])?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = params.not_before + Duration::days(SELF_SIGNED_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        info!("Generated self-signed certificate for {}", common_name);

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
        })
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        server_config(vec![self.cert_der()], self.key_der())
    }

    /// Write the certificate and key as PEM files
    pub fn save<P: AsRef<Path>>(&self, cert_path: P, key_path: P) -> Result<()> {
        fs::write(&cert_path, &self.cert_pem)?;
        fs::write(&key_path, &self.key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
