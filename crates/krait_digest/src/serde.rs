//! Serde adapters for digest outputs.
//!
//! Digests appear in repodata records, prefix records and cache state as
//! lowercase hex strings. The [`HexDigest`] wrapper plugs into `serde_with`'s
//! `serde_as` so any `Output<D>` field can be (de)serialized as hex.

use std::{fmt::LowerHex, ops::Deref};

use digest::{Digest, Output};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Deserializes the [`Output`] of a [`Digest`] from a hex string.
pub fn deserialize<'de, D, Dig: Digest>(deserializer: D) -> Result<Output<Dig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
    super::parse_digest_from_hex::<Dig>(str.as_ref())
        .ok_or_else(|| Error::custom("failed to parse hex digest"))
}

/// Serializes the [`Output`] of a [`Digest`] as a lowercase hex string.
pub fn serialize<'a, S: Serializer, Dig: Digest>(
    digest: &'a Output<Dig>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    &'a Output<Dig>: LowerHex,
{
    format!("{digest:x}").serialize(s)
}

/// Wrapper that (de)serializes a digest output as a hex string. Also usable
/// with `#[serde_as(as = "HexDigest<Sha256>")]`.
pub struct HexDigest<T: Digest>(pub Output<T>);

impl<T: Digest> Serialize for HexDigest<T>
where
    Output<T>: LowerHex,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize::<S, T>(&self.0, serializer)
    }
}

impl<'de, T: Digest + Default> Deserialize<'de> for HexDigest<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize::<D, T>(deserializer).map(HexDigest)
    }
}

impl<T: Digest> From<Output<T>> for HexDigest<T> {
    fn from(output: Output<T>) -> Self {
        HexDigest(output)
    }
}

impl<T: Digest> Deref for HexDigest<T> {
    type Target = Output<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Digest> SerializeAs<Output<T>> for HexDigest<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize_as<S: Serializer>(source: &Output<T>, serializer: S) -> Result<S::Ok, S::Error> {
        serialize::<S, T>(source, serializer)
    }
}

impl<'de, T: Digest + Default> DeserializeAs<'de, Output<T>> for HexDigest<T> {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Output<T>, D::Error> {
        deserialize::<D, T>(deserializer)
    }
}
