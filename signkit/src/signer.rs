/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::Path;

use thiserror::Error;
use x509_cert::Certificate;

use crate::crypto::{self, KeyAlgorithm, SigningKey, VerifyingKey};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Key algorithm of private key ({key}) does not match certificate ({cert})")]
    KeyAlgorithmMismatch { key: KeyAlgorithm, cert: KeyAlgorithm },
    #[error("Private key does not match certificate: {0}")]
    KeyMismatch(String),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Digest algorithms that can be requested for APK Signature Scheme v2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum V2Digest {
    Sha256,
    Sha512,
}

/// Digests requested when the caller does not specify any.
pub const DEFAULT_V2_DIGESTS: &[V2Digest] = &[V2Digest::Sha256];

/// APK Signature Scheme v2 signature algorithm IDs. RSA always uses PKCS#1
/// v1.5 rather than PSS so that signatures are deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum V2SignatureAlgorithm {
    RsaPkcs1V15WithSha256 = 0x0103,
    RsaPkcs1V15WithSha512 = 0x0104,
    EcdsaWithSha256 = 0x0201,
    EcdsaWithSha512 = 0x0202,
}

impl V2SignatureAlgorithm {
    pub fn new(key: KeyAlgorithm, digest: V2Digest) -> Self {
        match (key, digest) {
            (KeyAlgorithm::Rsa, V2Digest::Sha256) => Self::RsaPkcs1V15WithSha256,
            (KeyAlgorithm::Rsa, V2Digest::Sha512) => Self::RsaPkcs1V15WithSha512,
            (KeyAlgorithm::Ec, V2Digest::Sha256) => Self::EcdsaWithSha256,
            (KeyAlgorithm::Ec, V2Digest::Sha512) => Self::EcdsaWithSha512,
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Everything needed to produce one signature over an archive. Immutable once
/// constructed.
#[derive(Clone, Debug)]
pub struct SignerConfig {
    key: SigningKey,
    certificate: Certificate,
    signature_algorithms: Vec<V2SignatureAlgorithm>,
}

impl SignerConfig {
    pub fn new(key: SigningKey, certificate: Certificate, digests: &[V2Digest]) -> Result<Self> {
        let public_key = VerifyingKey::from_cert(&certificate)?;

        if key.algorithm() != public_key.algorithm() {
            return Err(Error::KeyAlgorithmMismatch {
                key: key.algorithm(),
                cert: public_key.algorithm(),
            });
        } else if key.verifying_key() != public_key {
            return Err(Error::KeyMismatch(
                certificate.tbs_certificate.subject.to_string(),
            ));
        }

        let signature_algorithms = digests
            .iter()
            .map(|d| V2SignatureAlgorithm::new(key.algorithm(), *d))
            .collect();

        Ok(Self {
            key,
            certificate,
            signature_algorithms,
        })
    }

    /// Signer backed by the compiled-in test key. Only suitable for images and
    /// packages where the identity of the signer does not matter.
    pub fn test_default() -> Result<Self> {
        let certificate = crypto::read_cert(crypto::TEST_CERT_PEM.as_bytes())?;
        let key = crypto::read_key(crypto::TEST_KEY_PEM.as_bytes())?;

        Self::new(key, certificate, DEFAULT_V2_DIGESTS)
    }

    pub fn from_files(cert_path: &Path, key_path: &Path, digests: &[V2Digest]) -> Result<Self> {
        let certificate = crypto::read_cert_file(cert_path)?;
        let key = crypto::read_key_file(key_path)?;

        Self::new(key, certificate, digests)
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn signature_algorithms(&self) -> &[V2SignatureAlgorithm] {
        &self.signature_algorithms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_rsa_sha256() {
        let config = SignerConfig::test_default().unwrap();

        assert_eq!(config.key().algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(
            config.signature_algorithms(),
            &[V2SignatureAlgorithm::RsaPkcs1V15WithSha256],
        );
        assert_eq!(V2SignatureAlgorithm::RsaPkcs1V15WithSha256.id(), 0x0103);
    }

    #[test]
    fn requested_digests_map_to_algorithms() {
        let config = SignerConfig::test_default().unwrap();
        let config = SignerConfig::new(
            config.key().clone(),
            config.certificate().clone(),
            &[V2Digest::Sha256, V2Digest::Sha512],
        )
        .unwrap();

        assert_eq!(
            config
                .signature_algorithms()
                .iter()
                .map(|a| a.id())
                .collect::<Vec<_>>(),
            [0x0103, 0x0104],
        );
        assert_eq!(
            V2SignatureAlgorithm::new(KeyAlgorithm::Ec, V2Digest::Sha512).id(),
            0x0202,
        );
    }
}
