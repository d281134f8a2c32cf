use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::module::TokenInfo;

//------------ TokenId -------------------------------------------------------

/// Identifies a physical token across insertions.
///
/// Slot numbers are not stable, a token is found again by what it says
/// about itself. The text form is `manufacturer/model/serial/label` where
/// `/`, `\` and anything outside printable ASCII is written as `\xHH`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TokenId {
    manufacturer: String,
    model: String,
    serial: String,
    label: String,
}

impl TokenId {
    pub fn new(manufacturer: &str, model: &str, serial: &str, label: &str) -> Self {
        TokenId {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            serial: serial.to_string(),
            label: label.to_string(),
        }
    }

    /// PKCS#11 pads these fields with blanks, which are not part of the id.
    pub fn from_info(info: &TokenInfo) -> Self {
        TokenId::new(
            info.manufacturer.trim_end(),
            info.model.trim_end(),
            info.serial.trim_end(),
            info.label.trim_end(),
        )
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The label, suitable for asking a user to insert the token.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            escape(&self.manufacturer),
            escape(&self.model),
            escape(&self.serial),
            escape(&self.label)
        )
    }
}

impl FromStr for TokenId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 {
            return Err(format!("token id needs four '/' separated parts, found {}", parts.len()));
        }
        Ok(TokenId {
            manufacturer: unescape(parts[0])?,
            model: unescape(parts[1])?,
            serial: unescape(parts[2])?,
            label: unescape(parts[3])?,
        })
    }
}

impl Serialize for TokenId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D>(d: D) -> Result<TokenId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        TokenId::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ Escaping ------------------------------------------------------

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte == b'/' || byte == b'\\' || !(0x20..0x7f).contains(&byte) {
            out.push_str(&format!("\\x{:02x}", byte));
        } else {
            out.push(byte as char);
        }
    }
    out
}

pub(crate) fn unescape(s: &str) -> Result<String, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'\\' {
            let escaped = bytes
                .get(pos + 1..pos + 4)
                .filter(|esc| esc[0] == b'x')
                .and_then(|esc| std::str::from_utf8(&esc[1..]).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| format!("invalid escape sequence in '{}'", s))?;
            out.push(escaped);
            pos += 4;
        } else {
            out.push(bytes[pos]);
            pos += 1;
        }
    }
    String::from_utf8(out).map_err(|_| format!("escaped value in '{}' is not UTF-8", s))
}

//------------ Tests ---------------------------------------------------------
