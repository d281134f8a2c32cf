use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use log::debug;
use secrecy::SecretString;
use serde::{de, Deserialize, Deserializer, Serialize};

//------------ PinCachePolicy ------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinCachePolicy {
    /// A PIN is used for one login only.
    Never,

    /// A PIN is kept for as long as the session with the token lives.
    #[default]
    Session,

    /// A PIN is kept for the configured time after it was entered.
    Timeout,
}

impl fmt::Display for PinCachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PinCachePolicy::Never => write!(f, "never"),
            PinCachePolicy::Session => write!(f, "session"),
            PinCachePolicy::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for PinCachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(PinCachePolicy::Never),
            "session" => Ok(PinCachePolicy::Session),
            "timeout" => Ok(PinCachePolicy::Timeout),
            _ => Err(format!(
                "expected \"never\", \"session\" or \"timeout\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for PinCachePolicy {
    fn deserialize<D>(d: D) -> Result<PinCachePolicy, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        PinCachePolicy::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ PinCache ------------------------------------------------------

/// The PIN remembered for one session.
#[derive(Default)]
pub(crate) struct PinCache {
    entry: Option<(SecretString, DateTime<Utc>)>,
}

impl PinCache {
    pub fn store(&mut self, pin: SecretString, policy: PinCachePolicy, now: DateTime<Utc>) {
        self.entry = match policy {
            PinCachePolicy::Never => None,
            PinCachePolicy::Session | PinCachePolicy::Timeout => Some((pin, now)),
        };
    }

    /// The cached PIN, if the policy still allows using it at `now`.
    pub fn get(&mut self, policy: PinCachePolicy, timeout: Duration, now: DateTime<Utc>) -> Option<&SecretString> {
        let expired = match (&self.entry, policy) {
            (None, _) => return None,
            (Some(_), PinCachePolicy::Never) => true,
            (Some(_), PinCachePolicy::Session) => false,
            (Some((_, stored)), PinCachePolicy::Timeout) => match chrono::Duration::from_std(timeout) {
                Ok(timeout) => now - *stored >= timeout,
                Err(_) => false,
            },
        };
        if expired {
            debug!("Cached PIN expired");
            self.entry = None;
        }
        self.entry.as_ref().map(|(pin, _)| pin)
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn pin() -> SecretString {
        SecretString::new("1234".to_string())
    }

    #[test]
    fn timeout_policy_expires() {
        let start = Utc::now();
        let mut cache = PinCache::default();
        cache.store(pin(), PinCachePolicy::Timeout, start);

        let timeout = Duration::from_secs(60);
        let soon = start + chrono::Duration::seconds(59);
        assert_eq!(
            cache.get(PinCachePolicy::Timeout, timeout, soon).unwrap().expose_secret(),
            "1234"
        );
        let later = start + chrono::Duration::seconds(60);
        assert!(cache.get(PinCachePolicy::Timeout, timeout, later).is_none());
        assert!(cache.get(PinCachePolicy::Session, Duration::ZERO, start).is_none());
    }

    #[test]
    fn never_policy_keeps_nothing() {
        let mut cache = PinCache::default();
        let now = Utc::now();
        cache.store(pin(), PinCachePolicy::Never, now);
        assert!(cache.get(PinCachePolicy::Session, Duration::ZERO, now).is_none());
    }

    #[test]
    fn session_policy_keeps_until_cleared() {
        let now = Utc::now();
        let mut cache = PinCache::default();
        cache.store(pin(), PinCachePolicy::Session, now);
        let much_later = now + chrono::Duration::days(30);
        assert!(cache.get(PinCachePolicy::Session, Duration::ZERO, much_later).is_some());
        cache.clear();
        assert!(cache.get(PinCachePolicy::Session, Duration::ZERO, much_later).is_none());
    }
}
