use pkcs11_helper::cli::options::Options;
use pkcs11_helper::cli::{Error, P11Client};

fn error(error: Error) {
    eprintln!("{}", error);
    ::std::process::exit(1);
}

fn main() {
    if let Err(e) = P11Client::report(Options::from_args()) {
        error(e)
    }
}
