//! Crypto engines used to bridge what a token can do natively into what a
//! caller asked for.
//!
//! A token may lack a hash-and-sign mechanism, or only offer raw RSA. The
//! engine fills the gap: it hashes, builds PKCS#1 blocks and parses
//! certificates. Engines are selected once per helper instance, see
//! [`select`].

#[cfg(feature = "openssl-engine")]
mod openssl_engine;
pub mod pkcs1;
#[cfg(feature = "rustcrypto")]
mod rustcrypto;

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::Error;

#[cfg(feature = "openssl-engine")]
pub use self::openssl_engine::OpenSslEngine;
#[cfg(feature = "rustcrypto")]
pub use self::rustcrypto::RustCryptoEngine;

//------------ DigestAlgorithm -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "sha1"),
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
            DigestAlgorithm::Sha384 => write!(f, "sha384"),
            DigestAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(format!("unknown digest algorithm '{}'", s)),
        }
    }
}

//------------ Mechanism -----------------------------------------------------

/// The RSA mechanisms the helper can perform with a token key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum Mechanism {
    /// PKCS#1 v1.5 padding over caller supplied data, usually a DigestInfo.
    RsaPkcs,

    /// Raw RSA, the caller supplies a full block.
    RsaX509,

    Sha1RsaPkcs,
    Sha256RsaPkcs,
    Sha384RsaPkcs,
    Sha512RsaPkcs,
}

impl Mechanism {
    pub const ALL: [Mechanism; 6] = [
        Mechanism::RsaPkcs,
        Mechanism::RsaX509,
        Mechanism::Sha1RsaPkcs,
        Mechanism::Sha256RsaPkcs,
        Mechanism::Sha384RsaPkcs,
        Mechanism::Sha512RsaPkcs,
    ];

    /// The digest of a hash-and-sign mechanism.
    pub fn digest(self) -> Option<DigestAlgorithm> {
        match self {
            Mechanism::Sha1RsaPkcs => Some(DigestAlgorithm::Sha1),
            Mechanism::Sha256RsaPkcs => Some(DigestAlgorithm::Sha256),
            Mechanism::Sha384RsaPkcs => Some(DigestAlgorithm::Sha384),
            Mechanism::Sha512RsaPkcs => Some(DigestAlgorithm::Sha512),
            Mechanism::RsaPkcs | Mechanism::RsaX509 => None,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Mechanism::RsaPkcs => "CKM_RSA_PKCS",
            Mechanism::RsaX509 => "CKM_RSA_X_509",
            Mechanism::Sha1RsaPkcs => "CKM_SHA1_RSA_PKCS",
            Mechanism::Sha256RsaPkcs => "CKM_SHA256_RSA_PKCS",
            Mechanism::Sha384RsaPkcs => "CKM_SHA384_RSA_PKCS",
            Mechanism::Sha512RsaPkcs => "CKM_SHA512_RSA_PKCS",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Mechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches("ckm_") {
            "rsa_pkcs" | "rsa-pkcs" => Ok(Mechanism::RsaPkcs),
            "rsa_x_509" | "rsa_x509" | "rsa-x509" => Ok(Mechanism::RsaX509),
            "sha1_rsa_pkcs" | "sha1-rsa" => Ok(Mechanism::Sha1RsaPkcs),
            "sha256_rsa_pkcs" | "sha256-rsa" => Ok(Mechanism::Sha256RsaPkcs),
            "sha384_rsa_pkcs" | "sha384-rsa" => Ok(Mechanism::Sha384RsaPkcs),
            "sha512_rsa_pkcs" | "sha512-rsa" => Ok(Mechanism::Sha512RsaPkcs),
            _ => Err(format!("unknown mechanism '{}'", s)),
        }
    }
}

//------------ CertificateInfo -----------------------------------------------

/// The parts of an X.509 certificate used for matching and display.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CertificateInfo {
    /// Distinguished name in `CN=..., O=...` form, in certificate order.
    pub subject: String,
    pub issuer: String,

    /// Lower case hex, without leading zero bytes.
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key_bits: Option<usize>,
}

/// Short names for the attribute types commonly found in a DN.
pub(crate) fn dn_short_name(oid: &str) -> Option<&'static str> {
    match oid {
        "2.5.4.3" => Some("CN"),
        "2.5.4.4" => Some("SN"),
        "2.5.4.5" => Some("serialNumber"),
        "2.5.4.6" => Some("C"),
        "2.5.4.7" => Some("L"),
        "2.5.4.8" => Some("ST"),
        "2.5.4.9" => Some("street"),
        "2.5.4.10" => Some("O"),
        "2.5.4.11" => Some("OU"),
        "2.5.4.12" => Some("title"),
        "2.5.4.42" => Some("GN"),
        "0.9.2342.19200300.100.1.25" => Some("DC"),
        "1.2.840.113549.1.9.1" => Some("emailAddress"),
        _ => None,
    }
}

pub(crate) fn serial_hex(bytes: &[u8]) -> String {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let hex = hex::encode(&bytes[first..]);
    if hex.is_empty() { "00".to_string() } else { hex }
}

//------------ CryptoEngine --------------------------------------------------

/// The primitives the helper needs from a crypto library.
pub trait CryptoEngine: Send + Sync + fmt::Debug {
    /// A short name, e.g. `openssl`.
    fn name(&self) -> &str;

    /// Whether the engine may be linked into GPL licensed applications.
    fn gpl_compatible(&self) -> bool;

    fn digest(&self, alg: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn certificate_info(&self, cert_der: &[u8]) -> Result<CertificateInfo, CryptoError>;

    /// Applies the public RSA operation of the certificate's key to `block`
    /// and returns a result as long as the modulus.
    fn rsa_public_raw(&self, cert_der: &[u8], block: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// The length in bytes of the RSA modulus of the certificate's key.
    fn rsa_modulus_len(&self, cert_der: &[u8]) -> Result<usize, CryptoError> {
        let bits = self
            .certificate_info(cert_der)?
            .public_key_bits
            .ok_or_else(|| CryptoError::Unsupported("certificate key is not RSA".to_string()))?;
        Ok(bits.div_ceil(8))
    }

    /// Hashes `data` and wraps the result in a DER DigestInfo.
    fn digest_info(&self, alg: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = self.digest(alg, data)?;
        Ok(pkcs1::digest_info(alg, &digest))
    }

    /// Checks a signature made with the certificate's key.
    fn verify(
        &self,
        cert_der: &[u8],
        mechanism: Mechanism,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let recovered = self.rsa_public_raw(cert_der, signature)?;
        let expected = match mechanism {
            Mechanism::RsaX509 => return Ok(pkcs1::left_pad(data, recovered.len())? == recovered),
            Mechanism::RsaPkcs => data.to_vec(),
            other => match other.digest() {
                Some(alg) => self.digest_info(alg, data)?,
                None => return Err(CryptoError::Unsupported(other.to_string())),
            },
        };
        match pkcs1::unpad_type1(&recovered) {
            Ok(payload) => Ok(payload == expected.as_slice()),
            Err(_) => Ok(false),
        }
    }
}

//------------ EngineId ------------------------------------------------------

/// Names an engine, or a policy to pick one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum EngineId {
    /// The first compiled-in engine in preference order.
    Auto,

    /// The first compiled-in GPL compatible engine in preference order.
    GplOnly,

    OpenSsl,
    RustCrypto,
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineId::Auto => write!(f, "auto"),
            EngineId::GplOnly => write!(f, "gpl"),
            EngineId::OpenSsl => write!(f, "openssl"),
            EngineId::RustCrypto => write!(f, "rustcrypto"),
        }
    }
}

impl FromStr for EngineId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(EngineId::Auto),
            "gpl" => Ok(EngineId::GplOnly),
            "openssl" => Ok(EngineId::OpenSsl),
            "rustcrypto" => Ok(EngineId::RustCrypto),
            _ => Err(format!(
                "expected \"auto\", \"gpl\", \"openssl\" or \"rustcrypto\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for EngineId {
    fn deserialize<D>(d: D) -> Result<EngineId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        EngineId::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ EngineSelection -----------------------------------------------

/// What `set_crypto` accepts: a built-in engine or policy, or a caller
/// supplied engine.
#[derive(Clone, Debug)]
pub enum EngineSelection {
    Id(EngineId),
    Custom(Arc<dyn CryptoEngine>),
}

impl Default for EngineSelection {
    fn default() -> Self {
        EngineSelection::Id(EngineId::Auto)
    }
}

impl From<EngineId> for EngineSelection {
    fn from(id: EngineId) -> Self {
        EngineSelection::Id(id)
    }
}

/// The engines compiled into this build, most preferred first.
pub fn compiled_engines() -> Vec<(EngineId, Arc<dyn CryptoEngine>)> {
    #[allow(unused_mut)]
    let mut engines: Vec<(EngineId, Arc<dyn CryptoEngine>)> = Vec::new();
    #[cfg(feature = "openssl-engine")]
    engines.push((EngineId::OpenSsl, Arc::new(OpenSslEngine)));
    #[cfg(feature = "rustcrypto")]
    engines.push((EngineId::RustCrypto, Arc::new(RustCryptoEngine)));
    engines
}

/// Resolves a selection into the engine to use.
pub fn select(selection: &EngineSelection) -> Result<Arc<dyn CryptoEngine>, Error> {
    let id = match selection {
        EngineSelection::Custom(engine) => return Ok(engine.clone()),
        EngineSelection::Id(id) => *id,
    };

    let candidate = compiled_engines().into_iter().find(|(engine_id, engine)| match id {
        EngineId::Auto => true,
        EngineId::GplOnly => engine.gpl_compatible(),
        specific => *engine_id == specific,
    });

    match candidate {
        Some((engine_id, engine)) => {
            debug!("Selected crypto engine '{}' for '{}'", engine_id, id);
            Ok(engine)
        }
        None => Err(Error::EngineUnavailable(id.to_string())),
    }
}

//------------ CryptoError ---------------------------------------------------

#[derive(Clone, Debug)]
pub enum CryptoError {
    Unsupported(String),
    InvalidCertificate(String),
    InvalidInput(String),
    Backend(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::Unsupported(s) => write!(f, "Unsupported by crypto engine: {}", s),
            CryptoError::InvalidCertificate(s) => write!(f, "Invalid certificate: {}", s),
            CryptoError::InvalidInput(s) => write!(f, "Invalid input: {}", s),
            CryptoError::Backend(s) => write!(f, "Crypto engine failure: {}", s),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<openssl::error::ErrorStack> for CryptoError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        CryptoError::Backend(err.to_string())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_first_compiled_engine() {
        let engine = select(&EngineSelection::Id(EngineId::Auto)).unwrap();
        let (_, first) = compiled_engines().into_iter().next().unwrap();
        assert_eq!(engine.name(), first.name());
    }

    #[test]
    #[cfg(feature = "rustcrypto")]
    fn gpl_only_skips_openssl() {
        let engine = select(&EngineSelection::Id(EngineId::GplOnly)).unwrap();
        assert!(engine.gpl_compatible());
        assert_eq!(engine.name(), "rustcrypto");
    }

    #[test]
    #[cfg(not(feature = "rustcrypto"))]
    fn gpl_only_unavailable_without_rustcrypto() {
        let err = select(&EngineSelection::Id(EngineId::GplOnly)).unwrap_err();
        assert_eq!(err.code(), crate::error::ResultCode::EngineUnavailable);
    }

    #[test]
    fn mechanism_names_parse() {
        for mech in Mechanism::ALL {
            assert_eq!(Mechanism::from_str(&mech.to_string()).unwrap(), mech);
        }
        assert_eq!(Mechanism::from_str("sha256-rsa").unwrap(), Mechanism::Sha256RsaPkcs);
        assert!(Mechanism::from_str("ecdsa").is_err());
    }

    #[test]
    fn serial_hex_strips_leading_zeros() {
        assert_eq!(serial_hex(&[0x00, 0x8f, 0x01]), "8f01");
        assert_eq!(serial_hex(&[0x00]), "00");
    }

    #[test]
    #[cfg(all(feature = "openssl-engine", feature = "rustcrypto"))]
    fn engines_agree_on_high_bit_serial() {
        use openssl::{
            asn1::Asn1Time,
            bn::BigNum,
            hash::MessageDigest,
            pkey::PKey,
            rsa::Rsa,
            x509::{X509NameBuilder, X509},
        };

        let key = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Serial").unwrap();
        let name = name.build();

        // Encoded with a leading zero byte to keep it positive.
        let serial = BigNum::from_hex_str("8F0102").unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(serial.to_asn1_integer().unwrap().as_ref()).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(Asn1Time::days_from_now(0).unwrap().as_ref()).unwrap();
        builder.set_not_after(Asn1Time::days_from_now(1).unwrap().as_ref()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let der = builder.build().to_der().unwrap();

        let from_openssl = OpenSslEngine.certificate_info(&der).unwrap();
        let from_rustcrypto = RustCryptoEngine.certificate_info(&der).unwrap();
        assert_eq!(from_openssl.serial, "8f0102");
        assert_eq!(from_rustcrypto.serial, "8f0102");
        assert_eq!(from_openssl.subject, from_rustcrypto.subject);
    }
}
