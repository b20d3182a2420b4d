//! Composite identity of one feature extraction instance.
//!
//! A [`Locator`] names the image, the pixel set, and the channel/z/t plane a
//! feature vector was computed from. Its wire form is the five fields joined
//! with dots, e.g. `"78615.0.0.0.0"`.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    pub image_id: u64,
    pub pixels_id: u64,
    pub channel: u64,
    pub z: u64,
    pub t: u64,
}

impl Locator {
    #[inline]
    #[must_use]
    pub fn new(image_id: u64, pixels_id: u64, channel: u64, z: u64, t: u64) -> Self {
        Self {
            image_id,
            pixels_id,
            channel,
            z,
            t,
        }
    }

    /// Locator of the first plane of an image's default pixel set.
    #[inline]
    #[must_use]
    pub fn image(image_id: u64) -> Self {
        Self::new(image_id, 0, 0, 0, 0)
    }

    #[inline]
    pub fn as_tuple(&self) -> (u64, u64, u64, u64, u64) {
        (self.image_id, self.pixels_id, self.channel, self.z, self.t)
    }
}

/// Serialize a locator tuple as `"i.p.c.z.t"`.
pub fn encode(image_id: u64, pixels_id: u64, channel: u64, z: u64, t: u64) -> String {
    Locator::new(image_id, pixels_id, channel, z, t).to_string()
}

/// Inverse of [`encode`].
pub fn decode(s: &str) -> Result<Locator> {
    let fields: Vec<&str> = s.split('.').collect();
    if fields.len() != FIELD_COUNT {
        return Err(Error::Format(format!(
            "locator '{}' has {} fields, expected {}",
            s,
            fields.len(),
            FIELD_COUNT
        )));
    }

    let mut values = [0u64; FIELD_COUNT];
    for (slot, field) in values.iter_mut().zip(&fields) {
        // u64::from_str accepts a leading '+', which would break exact round-trips
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Format(format!(
                "locator '{}' has non-integer field '{}'",
                s, field
            )));
        }
        *slot = field
            .parse()
            .map_err(|e| Error::Format(format!("locator '{}': {}", s, e)))?;
    }

    let [image_id, pixels_id, channel, z, t] = values;
    Ok(Locator::new(image_id, pixels_id, channel, z, t))
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.image_id, self.pixels_id, self.channel, self.z, self.t
        )
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode(s)
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }
}
