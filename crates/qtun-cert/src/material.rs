//! Loading certificate material

use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::{CertError, CertResult};

/// Identity and trust roots for one side of a mutual-TLS session
///
/// The same CA roots verify the peer in both directions: the server checks
/// client certificates against them and the client checks the server.
#[derive(Debug)]
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub roots: Vec<CertificateDer<'static>>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            roots: self.roots.clone(),
        }
    }
}

impl TlsMaterial {
    /// Build from PEM-encoded certificate chain, key and CA bundle
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> CertResult<Self> {
        let cert_chain = parse_certs(cert_pem, "certificate")?;
        let key = parse_private_key(key_pem, "private key")?;
        let roots = parse_certs(ca_pem, "CA bundle")?;

        Ok(Self {
            cert_chain,
            key,
            roots,
        })
    }

    /// Load from PEM files on disk
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> CertResult<Self> {
        let cert_chain = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        let roots = load_certs(ca_path.as_ref())?;

        debug!(
            "Loaded TLS material: {} chain certs, {} CA roots",
            cert_chain.len(),
            roots.len()
        );

        Ok(Self {
            cert_chain,
            key,
            roots,
        })
    }

    /// Build from base64-wrapped PEM strings, as passed through environment variables
    pub fn from_base64_pem(cert_b64: &str, key_b64: &str, ca_b64: &str) -> CertResult<Self> {
        Self::from_pem(
            &decode_base64_pem(cert_b64)?,
            &decode_base64_pem(key_b64)?,
            &decode_base64_pem(ca_b64)?,
        )
    }
}

/// Decode a base64 string holding PEM text; whitespace is ignored
pub fn decode_base64_pem(encoded: &str) -> CertResult<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| CertError::Base64(e.to_string()))
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> CertResult<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    parse_certs(&pem, &path.display().to_string())
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: &Path) -> CertResult<PrivateKeyDer<'static>> {
    let pem = read_file(path)?;
    parse_private_key(&pem, &path.display().to_string())
}

fn read_file(path: &Path) -> CertResult<Vec<u8>> {
    fs::read(path).map_err(|source| CertError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certs(mut pem: &[u8], what: &str) -> CertResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Pem(e.to_string()))?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(what.to_string()));
    }
    Ok(certs)
}

fn parse_private_key(mut pem: &[u8], what: &str) -> CertResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem)
        .map_err(|e| CertError::Pem(e.to_string()))?
        .ok_or_else(|| CertError::NoPrivateKey(what.to_string()))
}
