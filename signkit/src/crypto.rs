/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use cms::{
    cert::{CertificateChoices, IssuerAndSerialNumber},
    content_info::{CmsVersion, ContentInfo},
    signed_data::{
        CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignatureValue,
        SignedData, SignerIdentifier, SignerInfo, SignerInfos,
    },
};
use const_oid::{ObjectIdentifier, db::rfc5912};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use ring::digest::{self, Algorithm};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{Any, Decode, DecodePem, Encode},
    spki::AlgorithmIdentifierOwned,
};

/// Certificate of the compiled-in test key.
pub const TEST_CERT_PEM: &str = include_str!("../keys/testkey.x509.pem");
/// PKCS#8 private key of the compiled-in test key.
pub const TEST_KEY_PEM: &str = include_str!("../keys/testkey.pk8.pem");

#[derive(Debug, Error)]
pub enum Error {
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Unsupported private key type")]
    UnsupportedPrivateKey,
    #[error("Unsupported public key algorithm: {0}")]
    UnsupportedPublicKey(ObjectIdentifier),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedSignatureAlgorithm(ObjectIdentifier),
    #[error("{algorithm} cannot be used with an {key} key")]
    AlgorithmKeyMismatch {
        algorithm: SignatureAlgorithm,
        key: KeyAlgorithm,
    },
    #[error("SPKI error")]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error("DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("ECDSA error")]
    Ecdsa(#[from] p256::ecdsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    /// Name as used for signature block file extensions.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signature algorithms that can appear in boot image signatures and JAR
/// signature blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    Sha512WithRsa,
    Sha256WithEcdsa,
    Sha384WithEcdsa,
    Sha512WithEcdsa,
}

impl SignatureAlgorithm {
    pub fn from_oid(oid: ObjectIdentifier) -> Result<Self> {
        match oid {
            rfc5912::SHA_1_WITH_RSA_ENCRYPTION => Ok(Self::Sha1WithRsa),
            rfc5912::SHA_256_WITH_RSA_ENCRYPTION => Ok(Self::Sha256WithRsa),
            rfc5912::SHA_512_WITH_RSA_ENCRYPTION => Ok(Self::Sha512WithRsa),
            rfc5912::ECDSA_WITH_SHA_256 => Ok(Self::Sha256WithEcdsa),
            rfc5912::ECDSA_WITH_SHA_384 => Ok(Self::Sha384WithEcdsa),
            rfc5912::ECDSA_WITH_SHA_512 => Ok(Self::Sha512WithEcdsa),
            o => Err(Error::UnsupportedSignatureAlgorithm(o)),
        }
    }

    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1WithRsa => rfc5912::SHA_1_WITH_RSA_ENCRYPTION,
            Self::Sha256WithRsa => rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
            Self::Sha512WithRsa => rfc5912::SHA_512_WITH_RSA_ENCRYPTION,
            Self::Sha256WithEcdsa => rfc5912::ECDSA_WITH_SHA_256,
            Self::Sha384WithEcdsa => rfc5912::ECDSA_WITH_SHA_384,
            Self::Sha512WithEcdsa => rfc5912::ECDSA_WITH_SHA_512,
        }
    }

    pub fn algorithm_identifier(self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }

    pub fn digest(self) -> &'static Algorithm {
        match self {
            Self::Sha1WithRsa => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256WithRsa | Self::Sha256WithEcdsa => &digest::SHA256,
            Self::Sha384WithEcdsa => &digest::SHA384,
            Self::Sha512WithRsa | Self::Sha512WithEcdsa => &digest::SHA512,
        }
    }

    pub fn digest_oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1WithRsa => rfc5912::ID_SHA_1,
            Self::Sha256WithRsa | Self::Sha256WithEcdsa => rfc5912::ID_SHA_256,
            Self::Sha384WithEcdsa => rfc5912::ID_SHA_384,
            Self::Sha512WithRsa | Self::Sha512WithEcdsa => rfc5912::ID_SHA_512,
        }
    }

    pub fn key_algorithm(self) -> KeyAlgorithm {
        match self {
            Self::Sha1WithRsa | Self::Sha256WithRsa | Self::Sha512WithRsa => KeyAlgorithm::Rsa,
            Self::Sha256WithEcdsa | Self::Sha384WithEcdsa | Self::Sha512WithEcdsa => {
                KeyAlgorithm::Ec
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1WithRsa => "SHA1withRSA",
            Self::Sha256WithRsa => "SHA256withRSA",
            Self::Sha512WithRsa => "SHA512withRSA",
            Self::Sha256WithEcdsa => "SHA256withECDSA",
            Self::Sha384WithEcdsa => "SHA384withECDSA",
            Self::Sha512WithEcdsa => "SHA512withECDSA",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
pub enum SigningKey {
    Rsa(RsaPrivateKey),
    EcP256(p256::ecdsa::SigningKey),
    EcP384(p384::ecdsa::SigningKey),
    EcP521(p521::ecdsa::SigningKey),
}

impl SigningKey {
    /// Parse a DER-encoded PKCS#8 private key.
    pub fn from_pkcs8_der(data: &[u8]) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(data) {
            Ok(Self::Rsa(key))
        } else if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(data) {
            Ok(Self::EcP256(key))
        } else if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(data) {
            Ok(Self::EcP384(key))
        } else if let Ok(key) = p521::ecdsa::SigningKey::from_pkcs8_der(data) {
            Ok(Self::EcP521(key))
        } else {
            Err(Error::UnsupportedPrivateKey)
        }
    }

    /// Parse a PEM-encoded PKCS#8 private key. PKCS#1 RSA keys are accepted
    /// too.
    pub fn from_pem(data: &str) -> Result<Self> {
        if data.contains("BEGIN RSA PRIVATE KEY") {
            return RsaPrivateKey::from_pkcs1_pem(data)
                .map(Self::Rsa)
                .map_err(|_| Error::UnsupportedPrivateKey);
        }

        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(data) {
            Ok(Self::Rsa(key))
        } else if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(data) {
            Ok(Self::EcP256(key))
        } else if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_pem(data) {
            Ok(Self::EcP384(key))
        } else if let Ok(key) = p521::ecdsa::SigningKey::from_pkcs8_pem(data) {
            Ok(Self::EcP521(key))
        } else {
            Err(Error::UnsupportedPrivateKey)
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::EcP256(_) | Self::EcP384(_) | Self::EcP521(_) => KeyAlgorithm::Ec,
        }
    }

    /// The algorithm used when nothing else dictates one, eg. for boot image
    /// signatures.
    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Rsa(_) => SignatureAlgorithm::Sha256WithRsa,
            Self::EcP256(_) => SignatureAlgorithm::Sha256WithEcdsa,
            Self::EcP384(_) => SignatureAlgorithm::Sha384WithEcdsa,
            Self::EcP521(_) => SignatureAlgorithm::Sha512WithEcdsa,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            Self::Rsa(k) => VerifyingKey::Rsa(k.to_public_key()),
            Self::EcP256(k) => VerifyingKey::EcP256(*k.verifying_key()),
            Self::EcP384(k) => VerifyingKey::EcP384(*k.verifying_key()),
            Self::EcP521(k) => VerifyingKey::EcP521(k.verifying_key().clone()),
        }
    }

    /// Sign a precomputed digest. ECDSA signatures are returned DER-encoded.
    pub fn sign_digest(&self, algorithm: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
        let signature = match (self, algorithm) {
            (Self::Rsa(k), SignatureAlgorithm::Sha1WithRsa) => {
                k.sign(Pkcs1v15Sign::new::<Sha1>(), digest)?
            }
            (Self::Rsa(k), SignatureAlgorithm::Sha256WithRsa) => {
                k.sign(Pkcs1v15Sign::new::<Sha256>(), digest)?
            }
            (Self::Rsa(k), SignatureAlgorithm::Sha512WithRsa) => {
                k.sign(Pkcs1v15Sign::new::<Sha512>(), digest)?
            }
            // Any ECDSA digest can be used with any curve.
            (Self::EcP256(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                let sig: p256::ecdsa::Signature = k.sign_prehash(digest)?;
                sig.to_der().as_bytes().to_vec()
            }
            (Self::EcP384(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                let sig: p384::ecdsa::Signature = k.sign_prehash(digest)?;
                sig.to_der().as_bytes().to_vec()
            }
            (Self::EcP521(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                let sig: p521::ecdsa::Signature = k.sign_prehash(&p521_prehash(digest))?;
                sig.to_der().as_bytes().to_vec()
            }
            (k, a) => {
                return Err(Error::AlgorithmKeyMismatch {
                    algorithm: a,
                    key: k.algorithm(),
                });
            }
        };

        Ok(signature)
    }
}

/// The ecdsa crate rejects prehashes shorter than half the field size, which
/// rules out SHA-256 on P-521. Left padding with zeros keeps the same integer
/// value, so the signature is identical to one over the unpadded digest.
fn p521_prehash(digest: &[u8]) -> Vec<u8> {
    const FIELD_SIZE: usize = 66;

    let mut buf = vec![0u8; FIELD_SIZE.saturating_sub(digest.len())];
    buf.extend_from_slice(digest);
    buf
}

/// Never prints key material.
impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rsa(_) => "Rsa",
            Self::EcP256(_) => "EcP256",
            Self::EcP384(_) => "EcP384",
            Self::EcP521(_) => "EcP521",
        };

        f.debug_tuple(name).finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum VerifyingKey {
    Rsa(RsaPublicKey),
    EcP256(p256::ecdsa::VerifyingKey),
    EcP384(p384::ecdsa::VerifyingKey),
    EcP521(p521::ecdsa::VerifyingKey),
}

impl VerifyingKey {
    /// Get the public key from a certificate.
    pub fn from_cert(cert: &Certificate) -> Result<Self> {
        let spki = &cert.tbs_certificate.subject_public_key_info;
        let spki_der = spki.to_der()?;

        match spki.algorithm.oid {
            rfc5912::RSA_ENCRYPTION => Ok(Self::Rsa(RsaPublicKey::from_public_key_der(
                &spki_der,
            )?)),
            rfc5912::ID_EC_PUBLIC_KEY => {
                if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der) {
                    Ok(Self::EcP256(key))
                } else if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                {
                    Ok(Self::EcP384(key))
                } else if let Ok(key) = p521::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                {
                    Ok(Self::EcP521(key))
                } else {
                    Err(Error::UnsupportedPublicKey(spki.algorithm.oid))
                }
            }
            o => Err(Error::UnsupportedPublicKey(o)),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::EcP256(_) | Self::EcP384(_) | Self::EcP521(_) => KeyAlgorithm::Ec,
        }
    }

    /// Check a signature over a precomputed digest. A signature that does not
    /// match, including one that cannot be parsed, yields `Ok(false)`.
    pub fn verify_digest(
        &self,
        algorithm: SignatureAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let valid = match (self, algorithm) {
            (Self::Rsa(k), SignatureAlgorithm::Sha1WithRsa) => k
                .verify(Pkcs1v15Sign::new::<Sha1>(), digest, signature)
                .is_ok(),
            (Self::Rsa(k), SignatureAlgorithm::Sha256WithRsa) => k
                .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
                .is_ok(),
            (Self::Rsa(k), SignatureAlgorithm::Sha512WithRsa) => k
                .verify(Pkcs1v15Sign::new::<Sha512>(), digest, signature)
                .is_ok(),
            (Self::EcP256(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                p256::ecdsa::Signature::from_der(signature)
                    .is_ok_and(|s| k.verify_prehash(digest, &s).is_ok())
            }
            (Self::EcP384(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                p384::ecdsa::Signature::from_der(signature)
                    .is_ok_and(|s| k.verify_prehash(digest, &s).is_ok())
            }
            (Self::EcP521(k), a) if a.key_algorithm() == KeyAlgorithm::Ec => {
                p521::ecdsa::Signature::from_der(signature)
                    .is_ok_and(|s| k.verify_prehash(&p521_prehash(digest), &s).is_ok())
            }
            (k, a) => {
                return Err(Error::AlgorithmKeyMismatch {
                    algorithm: a,
                    key: k.algorithm(),
                });
            }
        };

        Ok(valid)
    }
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace, so the data is reformatted first.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for mut line in data.split(|&c| c == b'\n') {
        while !line.is_empty() && line[line.len() - 1].is_ascii_whitespace() {
            line = &line[..line.len() - 1];
        }

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

fn is_pem(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN")
}

/// Read a PEM or DER encoded certificate from a reader.
pub fn read_cert(mut reader: impl Read) -> Result<Certificate> {
    let mut data = vec![];
    reader.read_to_end(&mut data)?;

    let certificate = if is_pem(&data) {
        Certificate::from_pem(reformat_pem(&data)?)?
    } else {
        Certificate::from_der(&data)?
    };

    Ok(certificate)
}

/// Read a PEM or DER encoded certificate from a file.
pub fn read_cert_file(path: &Path) -> Result<Certificate> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;

    read_cert(BufReader::new(file))
}

/// Read a PEM or DER encoded PKCS#8 private key from a reader.
pub fn read_key(mut reader: impl Read) -> Result<SigningKey> {
    let mut data = vec![];
    reader.read_to_end(&mut data)?;

    if is_pem(&data) {
        let text = String::from_utf8(data).map_err(|_| Error::UnsupportedPrivateKey)?;
        SigningKey::from_pem(&text)
    } else {
        SigningKey::from_pkcs8_der(&data)
    }
}

/// Read a PEM or DER encoded PKCS#8 private key from a file.
pub fn read_key_file(path: &Path) -> Result<SigningKey> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;

    read_key(BufReader::new(file))
}

/// Check if a certificate matches a private key.
pub fn cert_matches_key(cert: &Certificate, key: &SigningKey) -> Result<bool> {
    let public_key = VerifyingKey::from_cert(cert)?;

    Ok(key.verifying_key() == public_key)
}

/// Create a CMS signature over detached content. No signed attributes are
/// included, so the signature covers nothing but the raw data.
pub fn cms_sign_detached(
    key: &SigningKey,
    cert: &Certificate,
    algorithm: SignatureAlgorithm,
    data: &[u8],
) -> Result<ContentInfo> {
    let digest = digest::digest(algorithm.digest(), data);

    cms_sign_digest(key, cert, algorithm, digest.as_ref())
}

/// Like [`cms_sign_detached`], but for content that was already hashed with
/// `algorithm`'s digest.
pub fn cms_sign_digest(
    key: &SigningKey,
    cert: &Certificate,
    algorithm: SignatureAlgorithm,
    digest: &[u8],
) -> Result<ContentInfo> {
    let signature = key.sign_digest(algorithm, digest)?;

    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: algorithm.digest_oid(),
        parameters: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: DigestAlgorithmIdentifiers::try_from(vec![digest_algorithm.clone()])?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: const_oid::db::rfc5911::ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet::try_from(vec![
            CertificateChoices::Certificate(cert.clone()),
        ])?),
        crls: None,
        signer_infos: SignerInfos::try_from(vec![SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_algorithm,
            signed_attrs: None,
            signature_algorithm: algorithm.algorithm_identifier(),
            signature: SignatureValue::new(signature)?,
            unsigned_attrs: None,
        }])?,
    };

    let content_info = ContentInfo {
        content_type: const_oid::db::rfc5911::ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    };

    Ok(content_info)
}

/// Parse a CMS [`SignedData`] structure from raw DER-encoded data.
pub fn parse_cms(data: &[u8]) -> Result<SignedData> {
    let ci = ContentInfo::from_der(data)?;
    let sd = ci.content.decode_as::<SignedData>()?;

    Ok(sd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> (Certificate, SigningKey) {
        let cert = read_cert(TEST_CERT_PEM.as_bytes()).unwrap();
        let key = read_key(TEST_KEY_PEM.as_bytes()).unwrap();
        (cert, key)
    }

    #[test]
    fn builtin_test_key_matches_cert() {
        let (cert, key) = test_key();

        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);
        assert!(cert_matches_key(&cert, &key).unwrap());
        assert_eq!(
            key.default_signature_algorithm(),
            SignatureAlgorithm::Sha256WithRsa,
        );
    }

    #[test]
    fn oid_table_round_trips() {
        for algorithm in [
            SignatureAlgorithm::Sha1WithRsa,
            SignatureAlgorithm::Sha256WithRsa,
            SignatureAlgorithm::Sha512WithRsa,
            SignatureAlgorithm::Sha256WithEcdsa,
            SignatureAlgorithm::Sha384WithEcdsa,
            SignatureAlgorithm::Sha512WithEcdsa,
        ] {
            assert_eq!(
                SignatureAlgorithm::from_oid(algorithm.oid()).unwrap(),
                algorithm,
            );
        }

        assert!(matches!(
            SignatureAlgorithm::from_oid(rfc5912::SHA_384_WITH_RSA_ENCRYPTION),
            Err(Error::UnsupportedSignatureAlgorithm(_)),
        ));
    }

    #[test]
    fn sign_and_verify_digest() {
        let (cert, key) = test_key();
        let public_key = VerifyingKey::from_cert(&cert).unwrap();
        let algorithm = SignatureAlgorithm::Sha256WithRsa;

        let digest = digest::digest(algorithm.digest(), b"payload");
        let signature = key.sign_digest(algorithm, digest.as_ref()).unwrap();
        assert!(
            public_key
                .verify_digest(algorithm, digest.as_ref(), &signature)
                .unwrap()
        );

        let other = digest::digest(algorithm.digest(), b"tampered");
        assert!(
            !public_key
                .verify_digest(algorithm, other.as_ref(), &signature)
                .unwrap()
        );
    }

    #[test]
    fn short_digest_is_padded_for_p521() {
        let padded = p521_prehash(&[0xab; 32]);
        assert_eq!(padded.len(), 66);
        assert!(padded[..34].iter().all(|&b| b == 0));
        assert!(padded[34..].iter().all(|&b| b == 0xab));

        assert_eq!(p521_prehash(&[0xcd; 64]).len(), 66);
    }

    #[test]
    fn mismatched_algorithm_is_rejected() {
        let (_, key) = test_key();

        assert!(matches!(
            key.sign_digest(SignatureAlgorithm::Sha256WithEcdsa, &[0u8; 32]),
            Err(Error::AlgorithmKeyMismatch {
                key: KeyAlgorithm::Rsa,
                ..
            }),
        ));
    }

    #[test]
    fn pem_with_long_lines_is_reformatted() {
        let mut long = String::new();
        let mut base64 = String::new();
        for line in TEST_CERT_PEM.lines() {
            if line.starts_with("-----") {
                if !base64.is_empty() {
                    long.push_str(&base64);
                    long.push('\n');
                    base64.clear();
                }
                long.push_str(line);
                long.push('\n');
            } else {
                base64.push_str(line);
            }
        }

        let expected = read_cert(TEST_CERT_PEM.as_bytes()).unwrap();
        assert_eq!(read_cert(long.as_bytes()).unwrap(), expected);

        let der = expected.to_der().unwrap();
        assert_eq!(read_cert(der.as_slice()).unwrap(), expected);
    }

    #[test]
    fn truncated_pem_is_rejected() {
        let data = b"-----BEGIN CERTIFICATE-----\nAAAA\n";
        assert!(matches!(read_cert(&data[..]), Err(Error::PemNoEndTag)));
    }

    #[test]
    fn detached_cms_contains_signer() {
        let (cert, key) = test_key();
        let ci = cms_sign_detached(&key, &cert, SignatureAlgorithm::Sha256WithRsa, b"data")
            .unwrap();

        let sd = parse_cms(&ci.to_der().unwrap()).unwrap();
        assert!(sd.encap_content_info.econtent.is_none());
        assert_eq!(sd.signer_infos.0.len(), 1);

        let signer_info = sd.signer_infos.0.get(0).unwrap();
        assert!(signer_info.signed_attrs.is_none());
        assert_eq!(signer_info.digest_alg.oid, rfc5912::ID_SHA_256);

        let digest = digest::digest(&digest::SHA256, b"data");
        let public_key = VerifyingKey::from_cert(&cert).unwrap();
        assert!(
            public_key
                .verify_digest(
                    SignatureAlgorithm::Sha256WithRsa,
                    digest.as_ref(),
                    signer_info.signature.as_bytes(),
                )
                .unwrap()
        );
    }
}
