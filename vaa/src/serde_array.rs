//! Serde support for byte arrays longer than the 32 elements std implements traits for.

use std::fmt;

use serde::{
    de::{Error, SeqAccess, Visitor},
    ser::SerializeTuple,
    Deserializer, Serializer,
};

pub fn serialize<const N: usize, S>(value: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_tuple(N)?;
    for v in value {
        seq.serialize_element(v)?;
    }

    seq.end()
}

struct ArrayVisitor<const N: usize>;
impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an array of length {N}")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut buf = [0u8; N];
        for (pos, slot) in buf.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| Error::invalid_length(pos, &self))?;
        }

        if seq.next_element::<u8>()?.is_some() {
            return Err(Error::invalid_length(N + 1, &self));
        }

        Ok(buf)
    }
}

pub fn deserialize<'de, const N: usize, D>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_tuple(N, ArrayVisitor)
}
