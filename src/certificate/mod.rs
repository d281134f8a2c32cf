//! Finding certificates on tokens and using their private keys.

mod criteria;
mod handle;
mod id;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

pub use self::criteria::CertificateCriteria;
pub use self::handle::CertificateHandle;
pub use self::id::CertificateId;

use crate::error::Error;
use crate::session::{TokenCertificate, TokenSession};
use crate::token::manager::TokenManager;
use crate::token::TokenId;

//------------ CertificateSummary --------------------------------------------

/// A certificate as listed for a user to choose from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CertificateSummary {
    /// The serialized id, usable with
    /// [`CertificateCriteria::from_certificate_id`].
    pub id: CertificateId,
    pub label: String,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

//------------ Search --------------------------------------------------------

/// A certificate that matched, with a session reference of its own.
pub(crate) struct Found {
    pub session: TokenSession,
    pub certificate: TokenCertificate,
}

impl Found {
    pub fn certificate_id(&self) -> CertificateId {
        CertificateId::new(self.session.token().clone(), self.certificate.id.clone())
    }

    pub fn into_handle(self, manager: Arc<TokenManager>) -> CertificateHandle {
        CertificateHandle::new(
            self.certificate_id(),
            self.certificate.label,
            self.certificate.value,
            self.session,
            manager,
        )
    }

    pub fn summary(&self, manager: &TokenManager) -> Result<CertificateSummary, Error> {
        let info = manager.ctx().engine.certificate_info(&self.certificate.value)?;
        Ok(CertificateSummary {
            id: self.certificate_id(),
            label: self.certificate.label.clone(),
            subject: info.subject,
            issuer: info.issuer,
            serial: info.serial,
            not_before: info.not_before,
            not_after: info.not_after,
        })
    }
}

/// Collects the matching certificates of all present tokens.
///
/// Tokens are visited in provider order, then by slot, and certificates in
/// the order the token returns them. When the criteria name a token that
/// is not present, the token prompt hook may ask for it.
pub(crate) fn search(manager: &Arc<TokenManager>, criteria: &CertificateCriteria) -> Result<Vec<Found>, Error> {
    manager.fetch()?;

    let tokens: Vec<TokenId> = match criteria.token_id() {
        Some(token) => vec![token.clone()],
        None => manager.tokens()?.into_iter().map(|present| present.token.id).collect(),
    };

    let mut found = Vec::new();
    for token in tokens {
        let session = if criteria.token_id().is_some() {
            manager.acquire_with_prompt(&token)?
        } else {
            match manager.acquire(&token) {
                Ok(session) => session,
                // Removed since it was listed.
                Err(Error::TokenNotPresent { .. }) => continue,
                Err(err) => return Err(err),
            }
        };
        let session = TokenSession::new(session, manager.clone());

        let certificates = match session.session().certificates() {
            Ok(certificates) => certificates,
            Err(err) if criteria.token_id().is_some() || err.is_fatal() => return Err(err),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!("Skipping certificates of token '{}': {}", token.label(), err);
                continue;
            }
        };

        for certificate in certificates {
            if !criteria.matches_object(&certificate) {
                continue;
            }
            if criteria.needs_content() {
                match criteria.matches_content(&certificate.value, manager.ctx().engine.as_ref()) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        debug!(
                            "Cannot match certificate '{}' on token '{}': {}",
                            certificate.label,
                            token.label(),
                            err
                        );
                        continue;
                    }
                }
            }
            found.push(Found {
                session: session.clone(),
                certificate,
            });
        }
    }

    debug!("{} certificate(s) match", found.len());
    Ok(found)
}
