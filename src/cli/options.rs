//! The options for the `p11helper` client.

use std::path::PathBuf;

use clap::Parser;

use crate::certificate::CertificateId;
use crate::cli::report::ReportFormat;
use crate::crypto::Mechanism;
use crate::token::TokenId;

//------------ Options -------------------------------------------------------

/// The command line options for the `p11helper` client.
#[derive(clap::Parser)]
#[command(version, about = "Lists and uses the certificates on PKCS#11 tokens.")]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// Path to the config file. The built-in defaults are used if the
    /// default file does not exist.
    #[arg(short, long, env = "P11HELPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Report format
    #[arg(short, long, env = "P11HELPER_FORMAT", default_value = "text")]
    pub format: ReportFormat,

    /// Never ask for PINs or tokens on the terminal.
    #[arg(long)]
    pub batch: bool,
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the tokens currently present.
    Tokens,

    /// List the certificates on the present tokens.
    Certificates(Certificates),

    /// Sign the content of a file with the key of a certificate.
    Sign(Sign),

    /// Decrypt a PKCS#1 v1.5 encrypted file with the key of a certificate.
    Decrypt(Decrypt),

    /// Report tokens being inserted and removed.
    Watch(Watch),

    /// List the crypto engines in this build.
    Engines,
}

//------------ Certificates --------------------------------------------------

#[derive(clap::Args)]
pub struct Certificates {
    /// Only list the certificates of this token.
    #[arg(long, short)]
    pub token: Option<TokenId>,

    /// Only list certificates whose subject contains this text.
    #[arg(long)]
    pub subject: Option<String>,

    /// Only list certificates whose issuer contains this text.
    #[arg(long)]
    pub issuer: Option<String>,

    /// Only list certificates with exactly this label.
    #[arg(long)]
    pub label: Option<String>,
}

//------------ Sign ----------------------------------------------------------

#[derive(clap::Args)]
pub struct Sign {
    /// The certificate id as listed by `certificates`.
    #[arg(long)]
    pub id: CertificateId,

    /// The mechanism, e.g. CKM_SHA256_RSA_PKCS.
    #[arg(long, short, default_value = "CKM_SHA256_RSA_PKCS")]
    pub mechanism: Mechanism,

    /// The file to sign.
    #[arg(long, short)]
    pub input: PathBuf,

    /// Write the signature to this file instead of reporting it.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

//------------ Decrypt -------------------------------------------------------

#[derive(clap::Args)]
pub struct Decrypt {
    /// The certificate id as listed by `certificates`.
    #[arg(long)]
    pub id: CertificateId,

    /// The encrypted file.
    #[arg(long, short)]
    pub input: PathBuf,

    /// Write the plaintext to this file instead of reporting it.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

//------------ Watch ---------------------------------------------------------

#[derive(clap::Args)]
pub struct Watch {
    /// How long to watch.
    #[arg(long, short, default_value = "60")]
    pub seconds: u64,
}

//------------ Tests ---------------------------------------------------------
