use crate::crypto::{CryptoEngine, CryptoError, DigestAlgorithm};
use crate::session::TokenCertificate;
use crate::token::TokenId;

use super::CertificateId;

//------------ CertificateCriteria -------------------------------------------

/// What a certificate must look like to be found.
///
/// Every criterion that is set must match. Id and label match exactly,
/// subject and issuer match as a substring of the `CN=..., O=...` form of
/// the distinguished name, and the fingerprint matches the SHA-1 or
/// SHA-256 hash of the DER certificate, depending on its length.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CertificateCriteria {
    token: Option<TokenId>,
    id: Option<Vec<u8>>,
    label: Option<String>,
    subject: Option<String>,
    issuer: Option<String>,
    fingerprint: Option<Vec<u8>>,
    unique: bool,
}

impl CertificateCriteria {
    /// Criteria that match every certificate.
    pub fn new() -> Self {
        CertificateCriteria::default()
    }

    /// Criteria for the certificate with a serialized id.
    pub fn from_certificate_id(id: &CertificateId) -> Self {
        CertificateCriteria::new().token(id.token().clone()).id(id.id())
    }

    pub fn token(mut self, token: TokenId) -> Self {
        self.token = Some(token);
        self
    }

    pub fn id(mut self, id: &[u8]) -> Self {
        self.id = Some(id.to_vec());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = Some(issuer.to_string());
        self
    }

    pub fn fingerprint(mut self, fingerprint: &[u8]) -> Self {
        self.fingerprint = Some(fingerprint.to_vec());
        self
    }

    /// Makes `find_certificate` fail with `ArgumentsBad` instead of
    /// picking one when several certificates match.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn token_id(&self) -> Option<&TokenId> {
        self.token.as_ref()
    }

    /// Checks the criteria that need nothing but the token object.
    pub(crate) fn matches_object(&self, cert: &TokenCertificate) -> bool {
        self.id.as_ref().map_or(true, |id| *id == cert.id)
            && self.label.as_ref().map_or(true, |label| *label == cert.label)
    }

    /// Whether matching needs the certificate to be parsed or hashed.
    pub(crate) fn needs_content(&self) -> bool {
        self.subject.is_some() || self.issuer.is_some() || self.fingerprint.is_some()
    }

    /// Checks the criteria on the content of the certificate.
    pub(crate) fn matches_content(&self, cert_der: &[u8], engine: &dyn CryptoEngine) -> Result<bool, CryptoError> {
        if let Some(fingerprint) = &self.fingerprint {
            let alg = match fingerprint.len() {
                20 => DigestAlgorithm::Sha1,
                32 => DigestAlgorithm::Sha256,
                48 => DigestAlgorithm::Sha384,
                64 => DigestAlgorithm::Sha512,
                len => {
                    return Err(CryptoError::InvalidInput(format!(
                        "fingerprint of {} bytes matches no digest",
                        len
                    )))
                }
            };
            if engine.digest(alg, cert_der)? != *fingerprint {
                return Ok(false);
            }
        }
        if self.subject.is_none() && self.issuer.is_none() {
            return Ok(true);
        }

        let info = engine.certificate_info(cert_der)?;
        Ok(self.subject.as_ref().map_or(true, |s| info.subject.contains(s.as_str()))
            && self.issuer.as_ref().map_or(true, |s| info.issuer.contains(s.as_str())))
    }
}

//------------ Tests ---------------------------------------------------------
