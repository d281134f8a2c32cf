//! Defines helper methods for Serializing and Deserializing external types.

use std::{str::FromStr, time::Duration};

use log::LevelFilter;
use serde::{de, Deserialize, Deserializer};

//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ Duration ------------------------------------------------------

/// Durations given in whole seconds.
pub fn de_duration_secs<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(d).map(Duration::from_secs)
}

/// Durations given in milliseconds.
pub fn de_duration_millis<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(d).map(Duration::from_millis)
}

pub fn de_duration_millis_opt<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(d).map(|millis| millis.map(Duration::from_millis))
}
