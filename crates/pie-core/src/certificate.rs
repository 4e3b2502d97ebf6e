//! Ed25519 certificates and identity signatures.
//!
//! Nodes authenticate with self-signed ed25519 X.509 certificates. The
//! certificate DER is hashed into the node [`Id`]; during the identity
//! handshake the connecting side signs the server's identity hash with the
//! certificate's private key.

use crate::error::{Error, Result};
use crate::id::Id;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x509_parser::prelude::*;

/// Subject alternative name embedded in generated certificates
const CERT_SUBJECT: &str = "pie";

/// A leaf certificate and its ed25519 signing key
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    key_der: Vec<u8>,
    signing_key: SigningKey,
}

/// Freshly generated certificate together with its PEM encodings
pub struct GeneratedCertificate {
    /// Loaded certificate
    pub certificate: Certificate,
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub key_pem: String,
}

impl Certificate {
    /// Generate a self-signed ed25519 certificate
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if key or certificate generation
    /// fails.
    pub fn generate() -> Result<GeneratedCertificate> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
            .map_err(|e| Error::InvalidConfig(format!("failed to generate key pair: {e}")))?;
        let params = rcgen::CertificateParams::new(vec![CERT_SUBJECT.to_string()])
            .map_err(|e| Error::InvalidConfig(format!("invalid certificate params: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::InvalidConfig(format!("failed to sign certificate: {e}")))?;

        let certificate = Self::from_der(cert.der().to_vec(), key_pair.serialize_der())?;
        Ok(GeneratedCertificate {
            certificate,
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a PEM certificate and its PEM private key
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either input fails to parse, the
    /// key is not ed25519, or the key does not belong to the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("invalid certificate PEM: {e}")))?;
        let key_pair = rcgen::KeyPair::from_pem(key_pem)
            .map_err(|e| Error::InvalidConfig(format!("invalid private key PEM: {e}")))?;
        Self::from_der(pem.contents, key_pair.serialize_der())
    }

    /// Load a DER certificate and its PKCS#8 DER private key
    ///
    /// # Errors
    ///
    /// See [`Certificate::from_pem`].
    pub fn from_der(der: Vec<u8>, key_der: Vec<u8>) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_der(&key_der)
            .map_err(|e| Error::InvalidConfig(format!("private key is not ed25519: {e}")))?;
        let public_key =
            public_key(&der).map_err(|e| Error::InvalidConfig(format!("invalid certificate: {e}")))?;
        if public_key != signing_key.verifying_key() {
            return Err(Error::InvalidConfig(
                "private key does not match certificate".to_string(),
            ));
        }
        Ok(Self {
            der,
            key_der,
            signing_key,
        })
    }

    /// Certificate DER
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PKCS#8 DER private key, as handed to the TLS stack
    #[must_use]
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Node identifier bound to this certificate
    #[must_use]
    pub fn id(&self) -> Id {
        Id::from_cert_der(&self.der)
    }

    /// Sign `msg` with the certificate key
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key.sign(msg).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id())
            .field("der_len", &self.der.len())
            .finish_non_exhaustive()
    }
}

/// Verify an ed25519 signature made by the key of a DER certificate
///
/// # Errors
///
/// Returns [`Error::SignatureInvalid`] if the certificate does not parse,
/// does not carry an ed25519 key, or the signature does not match.
pub fn verify_signature(cert_der: &[u8], msg: &[u8], signature: &[u8]) -> Result<()> {
    let key = public_key(cert_der).map_err(Error::SignatureInvalid)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| Error::SignatureInvalid(format!("malformed signature: {e}")))?;
    key.verify(msg, &signature)
        .map_err(|_| Error::SignatureInvalid("signature mismatch".to_string()))
}

fn public_key(cert_der: &[u8]) -> std::result::Result<VerifyingKey, String> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| format!("certificate parse failed: {e}"))?;
    let raw: &[u8] = cert.public_key().subject_public_key.data.as_ref();
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| format!("unexpected public key length {}", raw.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid ed25519 key: {e}"))
}
