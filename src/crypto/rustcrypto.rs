use chrono::{DateTime, Utc};
use rsa::{pkcs8::DecodePublicKey, traits::PublicKeyParts, BigUint, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::{certificate::X509Certificate, parse_x509_certificate, x509::X509Name};

use super::{dn_short_name, pkcs1, serial_hex, CertificateInfo, CryptoEngine, CryptoError, DigestAlgorithm};

/// Engine built from pure Rust crates, usable in GPL licensed applications.
#[derive(Debug, Default)]
pub struct RustCryptoEngine;

impl RustCryptoEngine {
    fn parse(cert_der: &[u8]) -> Result<X509Certificate<'_>, CryptoError> {
        let (_, cert) =
            parse_x509_certificate(cert_der).map_err(|err| CryptoError::InvalidCertificate(err.to_string()))?;
        Ok(cert)
    }

    fn rsa_key(cert: &X509Certificate<'_>) -> Result<RsaPublicKey, CryptoError> {
        RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|_| CryptoError::Unsupported("certificate key is not RSA".to_string()))
    }

    fn format_name(name: &X509Name<'_>) -> String {
        name.iter_attributes()
            .map(|attr| {
                let oid = attr.attr_type().to_id_string();
                let key = dn_short_name(&oid).map(ToString::to_string).unwrap_or(oid);
                let value = match attr.as_str() {
                    Ok(value) => value.to_string(),
                    Err(_) => hex::encode(attr.attr_value().data),
                };
                format!("{}={}", key, value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn to_datetime(timestamp: i64) -> Result<DateTime<Utc>, CryptoError> {
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| CryptoError::InvalidCertificate("validity date out of range".to_string()))
    }
}

impl CryptoEngine for RustCryptoEngine {
    fn name(&self) -> &str {
        "rustcrypto"
    }

    fn gpl_compatible(&self) -> bool {
        true
    }

    fn digest(&self, alg: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = match alg {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        };
        Ok(digest)
    }

    fn certificate_info(&self, cert_der: &[u8]) -> Result<CertificateInfo, CryptoError> {
        let cert = Self::parse(cert_der)?;
        let validity = cert.validity();
        let public_key_bits = Self::rsa_key(&cert).ok().map(|key| key.n().bits());

        Ok(CertificateInfo {
            subject: Self::format_name(cert.subject()),
            issuer: Self::format_name(cert.issuer()),
            serial: serial_hex(cert.raw_serial()),
            not_before: Self::to_datetime(validity.not_before.timestamp())?,
            not_after: Self::to_datetime(validity.not_after.timestamp())?,
            public_key_bits,
        })
    }

    fn rsa_public_raw(&self, cert_der: &[u8], block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cert = Self::parse(cert_der)?;
        let key = Self::rsa_key(&cert)?;

        let input = BigUint::from_bytes_be(block);
        if &input >= key.n() {
            return Err(CryptoError::InvalidInput("block is not smaller than the modulus".to_string()));
        }
        let output = input.modpow(key.e(), key.n());
        pkcs1::left_pad(&output.to_bytes_be(), key.size())
    }
}
