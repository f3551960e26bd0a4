use std::borrow::{Borrow, Cow};
use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize};

/// A bencode byte string. Ordering follows the raw bytes, which is the order bencode requires for
/// dictionary keys.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes<'a>(pub Cow<'a, [u8]>);

impl<'a> Serialize for Bytes<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

// `Cow<[u8]>` orders like `[u8]`, so lookups by a plain slice agree with the derived `Ord`
impl Borrow<[u8]> for Bytes<'_> {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl<'a> From<&'a [u8]> for Bytes<'a> {
    fn from(value: &'a [u8]) -> Self {
        Bytes(Cow::Borrowed(value))
    }
}

/// Any bencode value. Dictionaries are kept sorted, so serializing a decoded value yields its
/// canonical encoding.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BencodeValue<'a> {
    Int(i64),
    Bytes(Bytes<'a>),
    List(Vec<BencodeValue<'a>>),
    Dict(BTreeMap<Bytes<'a>, BencodeValue<'a>>),
}

impl<'a> BencodeValue<'a> {
    /// Looks up `key` if this value is a dictionary
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue<'a>> {
        match self {
            BencodeValue::Dict(dict) => dict.get(key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

impl<'a, 'de: 'a> serde::de::Deserialize<'de> for BencodeValue<'a> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor<'a> {
            lifetime: PhantomData<BencodeValue<'a>>,
        }

        impl<'a, 'de: 'a> serde::de::Visitor<'de> for Visitor<'a> {
            type Value = BencodeValue<'a>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a valid bencode value")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(v.into())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut v: Vec<BencodeValue<'a>> = Vec::new();
                while let Some(value) = seq.next_element()? {
                    v.push(value);
                }
                Ok(v.into())
            }

            fn visit_borrowed_bytes<E>(self, v: &'de [u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(v.into())
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(v.to_vec().into())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut dict = BTreeMap::new();
                while let Some(key) = map.next_key::<&'de [u8]>()? {
                    let value = map.next_value()?;
                    if dict.insert(Bytes(Cow::Borrowed(key)), value).is_some() {
                        return Err(serde::de::Error::custom("duplicate dictionary key"));
                    }
                }
                Ok(dict.into())
            }
        }

        deserializer.deserialize_any(Visitor { lifetime: PhantomData })
    }
}

impl From<i64> for BencodeValue<'_> {
    fn from(value: i64) -> Self {
        BencodeValue::Int(value)
    }
}

impl<'a> From<&'a [u8]> for BencodeValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        BencodeValue::Bytes(Bytes(Cow::Borrowed(value)))
    }
}

impl From<String> for BencodeValue<'_> {
    fn from(s: String) -> Self {
        BencodeValue::Bytes(Bytes(Cow::Owned(s.into_bytes())))
    }
}

impl<'a> From<&'a str> for BencodeValue<'a> {
    fn from(v: &'a str) -> Self {
        BencodeValue::Bytes(Bytes(Cow::Borrowed(v.as_bytes())))
    }
}

impl From<Vec<u8>> for BencodeValue<'_> {
    fn from(value: Vec<u8>) -> Self {
        BencodeValue::Bytes(Bytes(Cow::Owned(value)))
    }
}

impl<'a> From<Vec<BencodeValue<'a>>> for BencodeValue<'a> {
    fn from(value: Vec<BencodeValue<'a>>) -> Self {
        BencodeValue::List(value)
    }
}

impl<'a> From<BTreeMap<Bytes<'a>, BencodeValue<'a>>> for BencodeValue<'a> {
    fn from(value: BTreeMap<Bytes<'a>, BencodeValue<'a>>) -> Self {
        BencodeValue::Dict(value)
    }
}
