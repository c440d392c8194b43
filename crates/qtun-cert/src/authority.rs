//! Development certificate authority
//!
//! Generates a CA and leaf certificates suitable for mutual TLS. Leaves carry
//! both the serverAuth and clientAuth extended key usages so the same issuer
//! serves both tunnel peers. Not meant for production deployments.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use time::{Duration, OffsetDateTime};

use crate::material::TlsMaterial;
use crate::{CertError, CertResult};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A certificate authority held in memory
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// A leaf certificate issued by [`CertificateAuthority`]
pub struct IssuedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> CertResult<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key = KeyPair::generate().map_err(generation)?;
        let cert = params.self_signed(&key).map_err(generation)?;

        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue a leaf for `common_name`; IP literals in `names` become IP SANs
    pub fn issue(&self, common_name: &str, names: &[&str]) -> CertResult<IssuedCertificate> {
        let sans: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(sans).map_err(generation)?;
        params.distinguished_name = distinguished_name(common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let key = KeyPair::generate().map_err(generation)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(generation)?;

        Ok(IssuedCertificate {
            cert_der: cert.der().clone(),
            key_der: PrivateKeyDer::try_from(key.serialize_der())
                .map_err(|e| CertError::Generation(e.to_string()))?,
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a leaf and bundle it with this CA as the trust root
    pub fn issue_material(&self, common_name: &str, names: &[&str]) -> CertResult<TlsMaterial> {
        let leaf = self.issue(common_name, names)?;
        Ok(TlsMaterial {
            cert_chain: vec![leaf.cert_der],
            key: leaf.key_der,
            roots: vec![self.cert_der()],
        })
    }
}

impl IssuedCertificate {
    /// Write `<name>.crt` and `<name>.key` into `dir`, creating it if needed
    pub fn save_to_dir(&self, dir: &Path, name: &str) -> CertResult<()> {
        let io = |path: &Path| {
            let path = path.display().to_string();
            move |source| CertError::Io { path, source }
        };

        std::fs::create_dir_all(dir).map_err(io(dir))?;

        let cert_path = dir.join(format!("{}.crt", name));
        std::fs::write(&cert_path, &self.cert_pem).map_err(io(&cert_path))?;

        let key_path = dir.join(format!("{}.key", name));
        std::fs::write(&key_path, &self.key_pem).map_err(io(&key_path))?;

        Ok(())
    }
}

/// Fresh CA plus server and client material for `localhost`
pub fn dev_material() -> CertResult<(TlsMaterial, TlsMaterial)> {
    let ca = CertificateAuthority::generate("qtun development CA")?;
    let server = ca.issue_material("qtun server", &["localhost", "127.0.0.1", "::1"])?;
    let client = ca.issue_material("qtun client", &["qtun-client"])?;
    Ok((server, client))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "qtun");
    dn
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(days);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
}

fn generation(e: rcgen::Error) -> CertError {
    CertError::Generation(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_leaf() {
        let ca = CertificateAuthority::generate("unit ca").unwrap();
        let leaf = ca.issue("server", &["localhost", "127.0.0.1"]).unwrap();

        assert!(!leaf.cert_der.is_empty());
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(leaf.cert_der.as_ref(), ca.cert_der().as_ref());
    }

    #[test]
    fn test_dev_material_shares_root() {
        let (server, client) = dev_material().unwrap();
        assert_eq!(server.roots, client.roots);
        assert_ne!(server.cert_chain, client.cert_chain);
    }

    #[test]
    fn test_material_builds_mtls_configs() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (server, client) = dev_material().unwrap();

        let mut roots = rustls::RootCertStore::empty();
        for root in &server.roots {
            roots.add(root.clone()).unwrap();
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(roots.into())
            .build()
            .unwrap();
        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(server.cert_chain, server.key);
        assert!(server_config.is_ok());

        let mut roots = rustls::RootCertStore::empty();
        for root in &client.roots {
            roots.add(root.clone()).unwrap();
        }
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(client.cert_chain, client.key);
        assert!(client_config.is_ok());
    }
}
