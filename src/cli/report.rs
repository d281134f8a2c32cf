use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::certificate::{CertificateId, CertificateSummary};
use crate::crypto::{EngineId, Mechanism};
use crate::hooks::SlotEvent;
use crate::token::TokenSummary;

//------------ CommandOutput -------------------------------------------------

/// What a command has to tell the user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandOutput {
    Tokens(Vec<TokenSummary>),
    Certificates(Vec<CertificateSummary>),
    Signature(KeyOperation),
    Plaintext(KeyOperation),
    Event(SlotEvent),
    Engines(Vec<EngineInfo>),
    Empty,
}

impl CommandOutput {
    pub fn report(&self, fmt: ReportFormat) -> Result<Option<String>, ReportError> {
        match self {
            CommandOutput::Tokens(list) => Ok(Some(list.report(fmt)?)),
            CommandOutput::Certificates(list) => Ok(Some(list.report(fmt)?)),
            CommandOutput::Signature(op) | CommandOutput::Plaintext(op) => Ok(Some(op.report(fmt)?)),
            CommandOutput::Event(event) => Ok(Some(event.report(fmt)?)),
            CommandOutput::Engines(list) => Ok(Some(list.report(fmt)?)),
            CommandOutput::Empty => Ok(None),
        }
    }
}

//------------ KeyOperation --------------------------------------------------

/// The result of using a private key, hex encoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeyOperation {
    pub certificate: CertificateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    pub value: String,
}

impl KeyOperation {
    pub fn new(certificate: CertificateId, mechanism: Option<Mechanism>, value: &[u8]) -> Self {
        KeyOperation {
            certificate,
            mechanism,
            value: hex::encode(value),
        }
    }
}

//------------ EngineInfo ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct EngineInfo {
    pub id: EngineId,
    pub name: String,
    pub gpl_compatible: bool,
}

//------------ ReportFormat --------------------------------------------------

/// The format to use when presenting command output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, ReportError> {
        match s {
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnrecognisedFormat(s.to_string())),
        }
    }
}

//------------ ReportError ---------------------------------------------------

#[derive(Debug)]
pub enum ReportError {
    UnrecognisedFormat(String),
    Json(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognisedFormat(s) => write!(f, "This report format is not recognised: {}", s),
            ReportError::Json(e) => write!(f, "Cannot produce JSON: {}", e),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<serde_json::Error> for ReportError {
    fn from(e: serde_json::Error) -> Self {
        ReportError::Json(e.to_string())
    }
}

//------------ Report --------------------------------------------------------

/// Implemented by everything a command can output.
trait Report: Serialize {
    fn text(&self) -> String;

    fn report(&self, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Text => Ok(self.text()),
        }
    }
}

impl Report for Vec<TokenSummary> {
    fn text(&self) -> String {
        if self.is_empty() {
            return "<no tokens present>".to_string();
        }

        let mut res = String::new();
        for token in self {
            res.push_str(&format!("Token:     {}\n", token.id.label()));
            res.push_str(&format!("  Id:       {}\n", token.id));
            res.push_str(&format!("  Provider: {}\n", token.provider));
            res.push_str(&format!("  Slot:     {}\n", token.slot));
            if !token.reader.is_empty() {
                res.push_str(&format!("  Reader:   {}\n", token.reader));
            }
            if token.login_required {
                res.push_str("  Login:    required");
                if token.protected_auth_path {
                    res.push_str(" (protected authentication path)");
                }
                res.push('\n');
            }
            if token.user_pin_locked {
                res.push_str("  User PIN: locked\n");
            }
        }
        res
    }
}

impl Report for Vec<CertificateSummary> {
    fn text(&self) -> String {
        if self.is_empty() {
            return "<no certificates found>".to_string();
        }

        let mut res = String::new();
        for cert in self {
            res.push_str(&format!("Certificate: {}\n", cert.label));
            res.push_str(&format!("  Id:        {}\n", cert.id));
            res.push_str(&format!("  Subject:   {}\n", cert.subject));
            res.push_str(&format!("  Issuer:    {}\n", cert.issuer));
            res.push_str(&format!("  Serial:    {}\n", cert.serial));
            res.push_str(&format!(
                "  Valid:     {} until {}\n",
                cert.not_before.to_rfc3339(),
                cert.not_after.to_rfc3339()
            ));
        }
        res
    }
}

impl Report for KeyOperation {
    fn text(&self) -> String {
        self.value.clone()
    }
}

impl Report for SlotEvent {
    fn text(&self) -> String {
        self.to_string()
    }
}

impl Report for Vec<EngineInfo> {
    fn text(&self) -> String {
        let mut res = String::new();
        for engine in self {
            res.push_str(&engine.name);
            if engine.gpl_compatible {
                res.push_str(" (GPL compatible)");
            }
            res.push('\n');
        }
        res
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::token::TokenId;

    fn token() -> TokenSummary {
        TokenSummary {
            id: TokenId::new("ACME", "Key", "42", "Work"),
            provider: "soft".to_string(),
            slot: 1,
            reader: "Soft Reader 1".to_string(),
            login_required: true,
            protected_auth_path: false,
            user_pin_locked: false,
        }
    }

    #[test]
    fn format_from_str() {
        assert_eq!(ReportFormat::from_str("json").unwrap(), ReportFormat::Json);
        assert_eq!(ReportFormat::from_str("text").unwrap(), ReportFormat::Text);
        assert!(ReportFormat::from_str("xml").is_err());
    }

    #[test]
    fn tokens_as_text() {
        let text = CommandOutput::Tokens(vec![token()])
            .report(ReportFormat::Text)
            .unwrap()
            .unwrap();
        assert!(text.contains("Token:     Work"));
        assert!(text.contains("ACME/Key/42/Work"));
        assert!(text.contains("Reader:   Soft Reader 1\n"));
        assert!(text.contains("Login:    required\n"));
    }

    #[test]
    fn tokens_as_json() {
        let json = CommandOutput::Tokens(vec![token()])
            .report(ReportFormat::Json)
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["id"], "ACME/Key/42/Work");
        assert_eq!(value[0]["slot"], 1);
    }

    #[test]
    fn signature_is_hex() {
        let id = CertificateId::new(TokenId::new("ACME", "Key", "42", "Work"), vec![1]);
        let op = KeyOperation::new(id, Some(Mechanism::RsaPkcs), &[0xde, 0xad]);
        let text = CommandOutput::Signature(op).report(ReportFormat::Text).unwrap();
        assert_eq!(text.as_deref(), Some("dead"));
        assert_eq!(CommandOutput::Empty.report(ReportFormat::Json).unwrap(), None);
    }
}
