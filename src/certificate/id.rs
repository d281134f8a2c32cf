use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::token::TokenId;

//------------ CertificateId -------------------------------------------------

/// Identifies a certificate by its token and `CKA_ID`.
///
/// The text form is the token id followed by `/` and the `CKA_ID` in hex,
/// and can be kept in an application's configuration to find the same
/// certificate again.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CertificateId {
    token: TokenId,
    id: Vec<u8>,
}

impl CertificateId {
    pub fn new(token: TokenId, id: Vec<u8>) -> Self {
        CertificateId { token, id }
    }

    pub fn token(&self) -> &TokenId {
        &self.token
    }

    /// The `CKA_ID` shared by the certificate and its private key.
    pub fn id(&self) -> &[u8] {
        &self.id
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.token, hex::encode(&self.id))
    }
}

impl FromStr for CertificateId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, id) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("'{}' is not a certificate id", s))?;
        let token = TokenId::from_str(token)?;
        let id = hex::decode(id).map_err(|err| format!("invalid CKA_ID in '{}': {}", s, err))?;
        Ok(CertificateId { token, id })
    }
}

impl Serialize for CertificateId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CertificateId {
    fn deserialize<D>(d: D) -> Result<CertificateId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        CertificateId::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form() {
        let id = CertificateId::new(TokenId::new("ACME", "Key", "42", "Work/Home"), vec![0x01, 0xab]);
        assert_eq!(id.to_string(), "ACME/Key/42/Work\\x2fHome/01ab");
        assert_eq!(CertificateId::from_str("ACME/Key/42/Work\\x2fHome/01ab").unwrap(), id);
    }

    #[test]
    fn id_must_be_hex() {
        assert!(CertificateId::from_str("ACME/Key/42/Work/xyz").is_err());
        assert!(CertificateId::from_str("ACME/Key/42").is_err());
    }
}
