use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    hash::{hash, MessageDigest},
    rsa::Padding,
    x509::{X509, X509NameRef},
};

use super::{pkcs1, serial_hex, CertificateInfo, CryptoEngine, CryptoError, DigestAlgorithm};

/// Engine on top of the system OpenSSL library.
///
/// The OpenSSL license is not compatible with the GPL, see
/// [`super::EngineId::GplOnly`].
#[derive(Debug, Default)]
pub struct OpenSslEngine;

impl OpenSslEngine {
    fn parse(cert_der: &[u8]) -> Result<X509, CryptoError> {
        X509::from_der(cert_der).map_err(|err| CryptoError::InvalidCertificate(err.to_string()))
    }

    fn format_name(name: &X509NameRef) -> String {
        name.entries()
            .map(|entry| {
                let object = entry.object();
                let key = match object.nid().short_name() {
                    Ok(short) => short.to_string(),
                    Err(_) => object.to_string(),
                };
                let value = match entry.data().as_utf8() {
                    Ok(value) => value.to_string(),
                    Err(_) => hex::encode(entry.data().as_slice()),
                };
                format!("{}={}", key, value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>, CryptoError> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(time)?;
        let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| CryptoError::InvalidCertificate("validity date out of range".to_string()))
    }
}

impl CryptoEngine for OpenSslEngine {
    fn name(&self) -> &str {
        "openssl"
    }

    fn gpl_compatible(&self) -> bool {
        false
    }

    fn digest(&self, alg: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let md = match alg {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        };
        Ok(hash(md, data)?.to_vec())
    }

    fn certificate_info(&self, cert_der: &[u8]) -> Result<CertificateInfo, CryptoError> {
        let cert = Self::parse(cert_der)?;
        let serial = cert.serial_number().to_bn()?.to_vec();
        let public_key_bits = cert
            .public_key()
            .ok()
            .filter(|key| key.rsa().is_ok())
            .map(|key| key.bits() as usize);

        Ok(CertificateInfo {
            subject: Self::format_name(cert.subject_name()),
            issuer: Self::format_name(cert.issuer_name()),
            serial: serial_hex(&serial),
            not_before: Self::to_datetime(cert.not_before())?,
            not_after: Self::to_datetime(cert.not_after())?,
            public_key_bits,
        })
    }

    fn rsa_public_raw(&self, cert_der: &[u8], block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cert = Self::parse(cert_der)?;
        let rsa = cert
            .public_key()?
            .rsa()
            .map_err(|_| CryptoError::Unsupported("certificate key is not RSA".to_string()))?;
        let k = rsa.size() as usize;
        let input = pkcs1::left_pad(block, k)?;

        let mut out = vec![0u8; k];
        let len = rsa.public_decrypt(&input, &mut out, Padding::NONE)?;
        out.truncate(len);
        pkcs1::left_pad(&out, k)
    }
}
