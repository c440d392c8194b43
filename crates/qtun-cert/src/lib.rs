//! TLS material for mutually authenticated tunnels
//!
//! - [`TlsMaterial`]: certificate chain, private key and trusted CA roots,
//!   loaded from PEM files or base64-wrapped PEM strings
//! - [`CertificateAuthority`]: a throwaway CA that issues leaf certificates
//!   valid for both server and client authentication, for development and tests

pub mod authority;
pub mod material;

pub use authority::{dev_material, CertificateAuthority, IssuedCertificate};
pub use material::{decode_base64_pem, load_certs, load_private_key, TlsMaterial};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PEM: {0}")]
    Pem(String),

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid base64 PEM: {0}")]
    Base64(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}

pub type CertResult<T> = Result<T, CertError>;
