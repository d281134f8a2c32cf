use std::{
    fmt, fs, io,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use log::{info, trace, warn};
use secrecy::SecretString;

use crate::certificate::CertificateCriteria;
use crate::cli::options::{Certificates, Command, Decrypt, Options, Sign, Watch};
use crate::cli::report::{CommandOutput, EngineInfo, KeyOperation, ReportError, ReportFormat};
use crate::config::{ConfigError, HelperConfig};
use crate::constants::P11HELPER_DEFAULT_CONFIG_FILE;
use crate::crypto;
use crate::helper::{HelperBuilder, Pkcs11Helper};
use crate::hooks::{PinRequest, PinResponse, TokenPromptRequest, TokenPromptResponse};

//------------ P11Client -----------------------------------------------------

/// Runs one command of the `p11helper` tool against a helper instance.
pub struct P11Client {
    helper: Pkcs11Helper,
    format: ReportFormat,
}

impl P11Client {
    /// Processes the options and reports the output to the user. Error
    /// reporting is left to the caller.
    pub fn report(options: Options) -> Result<(), Error> {
        let format = options.general.format;
        let res = Self::process(options)?;

        if let Some(string) = res.report(format)? {
            println!("{}", string)
        }
        Ok(())
    }

    /// Processes the options and returns the output ready for formatting.
    pub fn process(options: Options) -> Result<CommandOutput, Error> {
        if let Command::Engines = options.command {
            return Ok(Self::engines());
        }

        let config = Self::config(options.general.config.as_deref())?;
        config.init_logging()?;

        let client = Self::start(&config, options.general.format, options.general.batch)?;
        let res = client.run(options.command);
        client.helper.terminate()?;
        res
    }

    fn config(path: Option<&Path>) -> Result<HelperConfig, Error> {
        match path {
            Some(path) => Ok(HelperConfig::read_config(path)?),
            None => {
                let path = Path::new(P11HELPER_DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Ok(HelperConfig::read_config(path)?)
                } else {
                    Ok(HelperConfig::default())
                }
            }
        }
    }

    fn start(config: &HelperConfig, format: ReportFormat, batch: bool) -> Result<Self, Error> {
        let helper = HelperBuilder::from_config(config).build();
        if !batch {
            helper.set_pin_prompt_hook(prompt_pin);
            helper.set_token_prompt_hook(prompt_token);
        }
        helper.initialize()?;

        if config.providers.is_empty() {
            warn!("No providers configured, no tokens will be found");
        }
        helper.add_configured_providers(config)?;

        Ok(P11Client { helper, format })
    }

    fn run(&self, command: Command) -> Result<CommandOutput, Error> {
        match command {
            Command::Tokens => Ok(CommandOutput::Tokens(self.helper.tokens()?)),
            Command::Certificates(cmd) => self.certificates(cmd),
            Command::Sign(cmd) => self.sign(cmd),
            Command::Decrypt(cmd) => self.decrypt(cmd),
            Command::Watch(cmd) => self.watch(cmd),
            Command::Engines => Ok(Self::engines()),
        }
    }

    fn certificates(&self, cmd: Certificates) -> Result<CommandOutput, Error> {
        let mut criteria = CertificateCriteria::new();
        if let Some(token) = cmd.token {
            criteria = criteria.token(token);
        }
        if let Some(subject) = &cmd.subject {
            criteria = criteria.subject(subject);
        }
        if let Some(issuer) = &cmd.issuer {
            criteria = criteria.issuer(issuer);
        }
        if let Some(label) = &cmd.label {
            criteria = criteria.label(label);
        }
        Ok(CommandOutput::Certificates(self.helper.certificates(&criteria)?))
    }

    fn sign(&self, cmd: Sign) -> Result<CommandOutput, Error> {
        let data = read_file(&cmd.input)?;
        let handle = self
            .helper
            .find_certificate(&CertificateCriteria::from_certificate_id(&cmd.id))?;
        let signature = self.helper.sign(&handle, cmd.mechanism, &data)?;

        match cmd.output {
            Some(path) => {
                write_file(&path, &signature)?;
                info!("Signature written to {}", path.display());
                Ok(CommandOutput::Empty)
            }
            None => Ok(CommandOutput::Signature(KeyOperation::new(
                cmd.id,
                Some(cmd.mechanism),
                &signature,
            ))),
        }
    }

    fn decrypt(&self, cmd: Decrypt) -> Result<CommandOutput, Error> {
        let data = read_file(&cmd.input)?;
        let handle = self
            .helper
            .find_certificate(&CertificateCriteria::from_certificate_id(&cmd.id))?;
        let plain = self.helper.decrypt(&handle, &data)?;

        match cmd.output {
            Some(path) => {
                write_file(&path, &plain)?;
                info!("Plaintext written to {}", path.display());
                Ok(CommandOutput::Empty)
            }
            None => Ok(CommandOutput::Plaintext(KeyOperation::new(cmd.id, None, &plain))),
        }
    }

    /// Prints slot events as they come in.
    ///
    /// Listing the tokens every second makes sure events are also seen with
    /// providers that only detect them when the helper is used.
    fn watch(&self, cmd: Watch) -> Result<CommandOutput, Error> {
        let format = self.format;
        self.helper.set_slot_event_hook(move |event| {
            match CommandOutput::Event(event.clone()).report(format) {
                Ok(Some(string)) => println!("{}", string),
                Ok(None) => {}
                Err(e) => warn!("Cannot report slot event: {}", e),
            }
        });

        let until = Instant::now() + Duration::from_secs(cmd.seconds);
        while Instant::now() < until {
            let tokens = self.helper.tokens()?;
            trace!("{} token(s) present", tokens.len());
            thread::sleep(Duration::from_secs(1).min(until.saturating_duration_since(Instant::now())));
        }

        self.helper.clear_slot_event_hook();
        Ok(CommandOutput::Empty)
    }

    fn engines() -> CommandOutput {
        CommandOutput::Engines(
            crypto::compiled_engines()
                .into_iter()
                .map(|(id, engine)| EngineInfo {
                    id,
                    name: engine.name().to_string(),
                    gpl_compatible: engine.gpl_compatible(),
                })
                .collect(),
        )
    }
}

fn prompt_pin(request: &PinRequest) -> PinResponse {
    let mut prompt = format!("PIN for token '{}'", request.token.label());
    if request.attempt > 1 {
        prompt.push_str(&format!(" (attempt {} of {})", request.attempt, request.max_attempts));
    }
    if let Some(left) = request.retries_left {
        prompt.push_str(&format!(", {} tries left on the token", left));
    }
    prompt.push_str(": ");

    match rpassword::prompt_password(prompt) {
        Ok(pin) if pin.is_empty() => PinResponse::Cancel,
        Ok(pin) => PinResponse::Pin(SecretString::new(pin)),
        Err(e) => {
            warn!("Cannot read PIN: {}", e);
            PinResponse::Cancel
        }
    }
}

fn prompt_token(request: &TokenPromptRequest) -> TokenPromptResponse {
    eprint!(
        "Please insert token '{}' and press enter, or enter 'c' to cancel: ",
        request.token.label()
    );

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => TokenPromptResponse::Cancel,
        Ok(_) if line.trim().eq_ignore_ascii_case("c") => TokenPromptResponse::Cancel,
        Ok(_) => TokenPromptResponse::Retry,
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::Io(format!("Cannot read {}: {}", path.display(), e)))
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), Error> {
    fs::write(path, content).map_err(|e| Error::Io(format!("Cannot write {}: {}", path.display(), e)))
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Helper(crate::error::Error),
    Report(ReportError),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Helper(e) => write!(f, "{} ({})", e, crate::error::get_message(e.code())),
            Error::Report(e) => e.fmt(f),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<crate::error::Error> for Error {
    fn from(e: crate::error::Error) -> Self {
        Error::Helper(e)
    }
}

impl From<ReportError> for Error {
    fn from(e: ReportError) -> Self {
        Error::Report(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn engines_need_no_config() {
        let options = Options::parse_from(["p11helper", "engines"]);
        match P11Client::process(options).unwrap() {
            CommandOutput::Engines(list) => {
                assert_eq!(list.len(), crypto::compiled_engines().len());
            }
            _ => panic!("expected engines"),
        }
    }
}
