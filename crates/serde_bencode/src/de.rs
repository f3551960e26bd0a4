use core::str;

use serde::{Deserialize, Deserializer};

use crate::{Error, ErrorKind};

pub struct BencodeDeserializer<'de> {
    input: &'de [u8],
    position: usize,
}

impl<'de> BencodeDeserializer<'de> {
    pub fn from_str(input: &'de str) -> Self {
        BencodeDeserializer {
            input: input.as_bytes(),
            position: 0,
        }
    }

    pub fn from_bytes(input: &'de [u8]) -> Self {
        BencodeDeserializer { input, position: 0 }
    }

    pub fn error(&self, kind: ErrorKind) -> Error {
        let err: Error = kind.into();
        err.set_position(self.position)
    }

    /// Number of input bytes that were not consumed yet
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub(crate) fn move_cursor(&mut self, by: usize) {
        self.position += by;
        self.input = &self.input[by..]
    }

    fn peek(&self, expected: &'static str) -> Result<u8, Error> {
        self.input
            .first()
            .copied()
            .ok_or_else(|| self.error(ErrorKind::UnexpectedEof(expected)))
    }
}

impl<'de> BencodeDeserializer<'de> {
    fn parse_integer(&mut self) -> Result<i64, Error> {
        let Some(pos) = self.input.iter().position(|byte| *byte == b'e') else {
            return Err(self.error(ErrorKind::UnexpectedEof("closing delimiter 'e' for integer")));
        };

        let digits = &self.input[..pos];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(self.error(ErrorKind::BadInputData("integer contains non-digit characters")));
        }
        if unsigned.len() > 1 && unsigned[0] == b'0' {
            return Err(self.error(ErrorKind::BadInputData("integer has leading zeros")));
        }
        if digits == b"-0" {
            return Err(self.error(ErrorKind::BadInputData("negative zero is not a valid integer")));
        }

        let parsed_integer: i64 = std::str::from_utf8(digits)
            .map_err(|_| self.error(ErrorKind::BadInputData("integer is not valid ascii")))?
            .parse()
            .map_err(|_| self.error(ErrorKind::BadInputData("integer doesn't fit into i64")))?;
        self.move_cursor(pos + 1);
        Ok(parsed_integer)
    }

    fn parse_bytes(&mut self) -> Result<&'de [u8], Error> {
        let Some(delim_pos) = self.input.iter().position(|byte| *byte == b':') else {
            return Err(self.error(ErrorKind::UnexpectedEof("byte string delimiter ':'")));
        };

        let raw_bytes_len = &self.input[..delim_pos];
        if raw_bytes_len.is_empty() || !raw_bytes_len.iter().all(u8::is_ascii_digit) {
            return Err(self.error(ErrorKind::BadInputData("expected a valid byte string length")));
        }
        let bytes_len: usize = std::str::from_utf8(raw_bytes_len)
            .map_err(|_| self.error(ErrorKind::BadInputData("byte string length is not valid ascii")))?
            .parse()
            .map_err(|_| self.error(ErrorKind::BadInputData("byte string length is too large")))?;

        let Some(end) = (delim_pos + 1).checked_add(bytes_len).filter(|end| *end <= self.input.len()) else {
            return Err(self.error(ErrorKind::UnexpectedEof("byte string contents")));
        };

        let raw_bytes = &self.input[delim_pos + 1..end];
        self.move_cursor(end);
        Ok(raw_bytes)
    }

    fn parse_bytes_checked(&mut self) -> Result<&'de [u8], Error> {
        match self.peek("byte string")? {
            b'0'..=b'9' => self.parse_bytes(),
            _ => Err(self.error(ErrorKind::BadInputData("expected byte string length"))),
        }
    }

    fn expect_end(&mut self, what: &'static str) -> Result<(), Error> {
        match self.peek(what)? {
            b'e' => {
                self.move_cursor(1);
                Ok(())
            }
            _ => Err(self.error(ErrorKind::BadInputData(what))),
        }
    }
}

impl<'de, 'a> serde::de::Deserializer<'de> for &'a mut BencodeDeserializer<'de> {
    type Error = Error;

    fn deserialize_bool<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(self.error(ErrorKind::Unsupported("bool")))
    }

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.peek("any bencode value")? {
            b'd' => self.deserialize_map(visitor),
            b'l' => self.deserialize_seq(visitor),
            b'i' => self.deserialize_i64(visitor),
            b'0'..=b'9' => self.deserialize_bytes(visitor),
            _ => Err(self.error(ErrorKind::BadInputData("unknown bencode value type"))),
        }
    }

    fn deserialize_i8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.peek("integer")? {
            b'i' => {
                // Skip int label
                self.move_cursor(1);
                visitor.visit_i64(self.parse_integer()?)
            }
            _ => Err(self.error(ErrorKind::BadInputData("expected integer label 'i'"))),
        }
    }

    fn deserialize_u8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_f32<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(self.error(ErrorKind::Unsupported("f32")))
    }

    fn deserialize_f64<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(self.error(ErrorKind::Unsupported("f64")))
    }

    fn deserialize_char<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(self.error(ErrorKind::Unsupported("char")))
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let str = str::from_utf8(self.parse_bytes_checked()?)
            .map_err(|_| self.error(ErrorKind::BadInputData("expected valid utf8 string")))?;
        visitor.visit_borrowed_str(str)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        visitor.visit_borrowed_bytes(self.parse_bytes_checked()?)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        // An empty byte string stands for `None`
        if self.input.starts_with(b"0:") {
            self.move_cursor(2);
            return visitor.visit_none();
        }
        visitor.visit_some(&mut *self)
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let bytes = self.parse_bytes_checked()?;
        if !bytes.is_empty() {
            return Err(self.error(ErrorKind::BadInputData("expected bencode string of length 0")));
        }
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.peek("bencode list")? {
            b'l' => {
                // Skip list label
                self.move_cursor(1);
                let value = visitor.visit_seq(BencodeAccessor { de: self })?;
                self.expect_end("expected bencode list end")?;
                Ok(value)
            }
            _ => Err(self.error(ErrorKind::BadInputData("expected bencode list"))),
        }
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(self, _name: &'static str, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.peek("bencode dictionary")? {
            b'd' => {
                // Skip dict label
                self.move_cursor(1);
                let value = visitor.visit_map(BencodeAccessor { de: self })?;
                self.expect_end("expected bencode dictionary end")?;
                Ok(value)
            }
            _ => Err(self.error(ErrorKind::BadInputData("expected bencode dictionary"))),
        }
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.peek("bencode dictionary")? {
            b'd' => {
                // Skip dict label
                self.move_cursor(1);
                let value = visitor.visit_enum(BencodeAccessor { de: self })?;
                self.expect_end("expected the end of an enum dictionary")?;
                Ok(value)
            }
            // Unit variants may also be encoded as plain strings
            b'0'..=b'9' => {
                let variant = self.parse_bytes()?;
                let variant = str::from_utf8(variant)
                    .map_err(|_| self.error(ErrorKind::BadInputData("enum variant is not valid utf8")))?;
                visitor.visit_enum(serde::de::value::StrDeserializer::<Error>::new(variant))
            }
            _ => Err(self.error(ErrorKind::BadInputData("expected bencode dictionary"))),
        }
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_any(visitor)
    }
}

struct BencodeAccessor<'a, 'de> {
    de: &'a mut BencodeDeserializer<'de>,
}

impl<'a, 'de> serde::de::SeqAccess<'de> for BencodeAccessor<'a, 'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: serde::de::DeserializeSeed<'de>,
    {
        if self.de.peek("next list element or end")? == b'e' {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }
}

impl<'a, 'de> serde::de::MapAccess<'de> for BencodeAccessor<'a, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: serde::de::DeserializeSeed<'de>,
    {
        if self.de.peek("next dictionary key or end")? == b'e' {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.de)
    }
}

impl<'de, 'a> serde::de::EnumAccess<'de> for BencodeAccessor<'a, 'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant), Self::Error>
    where
        V: serde::de::DeserializeSeed<'de>,
    {
        Ok((seed.deserialize(&mut *self.de)?, self))
    }
}

impl<'de, 'a> serde::de::VariantAccess<'de> for BencodeAccessor<'a, 'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<(), Self::Error> {
        let bytes = self.de.parse_bytes_checked()?;
        if !bytes.is_empty() {
            return Err(self
                .de
                .error(ErrorKind::BadInputData("expected bencode string of length 0")));
        }
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value, Self::Error>
    where
        T: serde::de::DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.de)
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.de.deserialize_seq(visitor)
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.de.deserialize_map(visitor)
    }
}

pub fn from_bytes<'de, T: Deserialize<'de>>(input: &'de [u8]) -> Result<T, Error> {
    let mut deserializer = BencodeDeserializer::from_bytes(input);
    let deserialized = T::deserialize(&mut deserializer)?;
    if deserializer.remaining() > 0 {
        return Err(deserializer.error(ErrorKind::TrailingBytes(deserializer.remaining())));
    }
    Ok(deserialized)
}

pub fn from_str<'de, T: Deserialize<'de>>(input: &'de str) -> Result<T, Error> {
    from_bytes(input.as_bytes())
}
