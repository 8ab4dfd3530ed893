//! Secret lifecycle helpers
//!
//! A Secret is only referenced from rendered config after it passed
//! validation here. TLS secrets become a single PEM file (certificate then
//! key), JWK secrets a key file the proxy reads for JWT validation.

use k8s_openapi::api::core::v1::Secret;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use thiserror::Error;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const JWK_KEY: &str = "jwk";

/// File name of the default server certificate
pub const DEFAULT_SERVER_SECRET_NAME: &str = "default";
/// File name of the wildcard certificate used by TLS entries without a secret
pub const WILDCARD_SECRET_NAME: &str = "wildcard";

pub const TLS_SECRET_FILE_MODE: u32 = 0o600;
pub const JWK_SECRET_FILE_MODE: u32 = 0o644;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("Secret doesn't have {0}")]
    MissingKey(&'static str),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Secret is not a TLS or JWK secret")]
    UnknownKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Tls,
    Jwk,
}

fn data<'a>(secret: &'a Secret, key: &'static str) -> Result<&'a [u8], SecretError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .ok_or(SecretError::MissingKey(key))
}

/// A TLS secret must hold at least one PEM certificate and a PEM private key
pub fn validate_tls_secret(secret: &Secret) -> Result<(), SecretError> {
    let cert_pem = data(secret, TLS_CERT_KEY)?;
    let key_pem = data(secret, TLS_PRIVATE_KEY_KEY)?;

    let mut cert_reader = BufReader::new(cert_pem);
    let chain = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SecretError::InvalidCertificate(e.to_string()))?;
    if chain.is_empty() {
        return Err(SecretError::InvalidCertificate(
            "No certificate found".to_string(),
        ));
    }

    let mut key_reader = BufReader::new(key_pem);
    private_key(&mut key_reader)
        .map_err(|e| SecretError::InvalidPrivateKey(e.to_string()))?
        .ok_or_else(|| SecretError::InvalidPrivateKey("No private key found".to_string()))?;

    Ok(())
}

pub fn validate_jwk_secret(secret: &Secret) -> Result<(), SecretError> {
    data(secret, JWK_KEY).map(|_| ())
}

pub fn secret_kind(secret: &Secret) -> Result<SecretKind, SecretError> {
    if validate_tls_secret(secret).is_ok() {
        return Ok(SecretKind::Tls);
    }
    if validate_jwk_secret(secret).is_ok() {
        return Ok(SecretKind::Jwk);
    }
    Err(SecretError::UnknownKind)
}

/// TLS secrets are always accepted. JWK secrets only with Plus.
pub fn validate_secret(secret: &Secret, nginx_plus: bool) -> Result<SecretKind, SecretError> {
    let tls = validate_tls_secret(secret);
    if !nginx_plus {
        return tls.map(|_| SecretKind::Tls);
    }
    match (tls, validate_jwk_secret(secret)) {
        (Ok(()), _) => Ok(SecretKind::Tls),
        (_, Ok(())) => Ok(SecretKind::Jwk),
        _ => Err(SecretError::UnknownKind),
    }
}

/// Secrets watched by the controller: anything shaped like a TLS or JWK secret
pub fn is_supported_secret(secret: &Secret) -> bool {
    let has = |key| {
        secret
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key(key))
    };
    (has(TLS_CERT_KEY) && has(TLS_PRIVATE_KEY_KEY)) || has(JWK_KEY)
}

/// PEM file content: certificate, newline, key
pub fn pem_content(secret: &Secret) -> Vec<u8> {
    let mut content = Vec::new();
    if let Ok(cert) = data(secret, TLS_CERT_KEY) {
        content.extend_from_slice(cert);
    }
    content.push(b'\n');
    if let Ok(key) = data(secret, TLS_PRIVATE_KEY_KEY) {
        content.extend_from_slice(key);
    }
    content
}

pub fn jwk_content(secret: &Secret) -> Vec<u8> {
    data(secret, JWK_KEY).map(<[u8]>::to_vec).unwrap_or_default()
}
