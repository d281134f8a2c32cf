//! The _PKCS#11 Helper_ library crate.
//!
//! Finds certificates on smart cards, USB keys and other PKCS#11 tokens and
//! uses their private keys, without the application having to deal with
//! slots, sessions, logins or tokens coming and going.
//!
//! ```no_run
//! use pkcs11_helper::{CertificateCriteria, Mechanism, Pkcs11Helper, ProviderSettings};
//!
//! # fn main() -> Result<(), pkcs11_helper::Error> {
//! let helper = Pkcs11Helper::builder().build();
//! helper.initialize()?;
//! helper.add_provider("/usr/lib/opensc-pkcs11.so", ProviderSettings::default())?;
//!
//! let cert = helper.find_certificate(&CertificateCriteria::new().subject("CN=Alice"))?;
//! let signature = helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data")?;
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod cli;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod ext_serde;
pub mod helper;
pub mod hooks;
pub mod module;
pub mod session;
pub mod system;
pub mod token;

pub use self::certificate::{CertificateCriteria, CertificateHandle, CertificateId, CertificateSummary};
pub use self::config::HelperConfig;
pub use self::crypto::{CryptoEngine, DigestAlgorithm, EngineId, EngineSelection, Mechanism};
pub use self::error::{get_message, Error, ResultCode};
pub use self::helper::{HelperBuilder, Pkcs11Helper};
pub use self::hooks::{PinRequest, PinResponse, SlotEvent, SlotEventKind, TokenPromptRequest, TokenPromptResponse};
pub use self::session::{LoginState, PinCachePolicy, TokenSession};
pub use self::system::{OsSystem, SystemServices};
pub use self::token::{PrivateMode, ProviderId, ProviderSettings, SlotEventMethod, TokenId, TokenSummary};
