//! The `p11helper` command line client.

pub mod options;
pub mod report;

mod client;
pub use self::client::{Error, P11Client};
