//! Serde support for [`Hll`], enabled with the `with_serde` feature.
//!
//! Counters pass through their storage-spec byte encoding, so a counter
//! serialized with serde stays interoperable with every other consumer of
//! the wire format regardless of the serde data format wrapped around it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hll::Hll;

impl Serialize for Hll {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Hll {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Hll::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
