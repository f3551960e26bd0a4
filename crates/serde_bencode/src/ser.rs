use std::io::Write;

use serde::Serialize;

use crate::{error::Error, ErrorKind};

/// Bencode serializer.
///
/// Dictionaries and structs are always written with their keys sorted as raw byte strings, which
/// makes the output canonical: the same value always serializes to the same bytes.
pub struct Serializer<'a, W: Write> {
    output: &'a mut W,
}

impl<'a, W: Write> Serializer<'a, W> {
    pub fn new(output: &'a mut W) -> Self {
        Serializer { output }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.output.write_all(bytes)?;
        Ok(())
    }

    fn write_byte_string(&mut self, bytes: &[u8]) -> Result<(), Error> {
        write!(self.output, "{}:", bytes.len())?;
        self.write(bytes)
    }
}

/// Buffers dictionary entries until the dictionary is finished, so that they can be emitted in
/// key order.
pub struct SerializeDict<'a, 'w, W: Write> {
    serializer: &'a mut Serializer<'w, W>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pending_key: Option<Vec<u8>>,
    closing: &'static [u8],
}

impl<'a, 'w, W: Write> SerializeDict<'a, 'w, W> {
    fn new(serializer: &'a mut Serializer<'w, W>, closing: &'static [u8]) -> Self {
        SerializeDict {
            serializer,
            entries: Vec::new(),
            pending_key: None,
            closing,
        }
    }

    fn finish(mut self) -> Result<(), Error> {
        self.entries.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        if self.entries.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(ErrorKind::BadInputData("duplicate dictionary key").into());
        }

        self.serializer.write(b"d")?;
        for (key, value) in self.entries.iter() {
            self.serializer.write_byte_string(key)?;
            self.serializer.write(value)?;
        }
        self.serializer.write(self.closing)
    }
}

/// Extracts the raw bytes of an encoded bencode string (`<len>:<bytes>`).
fn raw_key(encoded: Vec<u8>) -> Result<Vec<u8>, Error> {
    let Some(delim_pos) = encoded.iter().position(|byte| *byte == b':') else {
        return Err(ErrorKind::Unsupported("non-string dictionary keys").into());
    };
    if delim_pos == 0 || !encoded[..delim_pos].iter().all(u8::is_ascii_digit) {
        return Err(ErrorKind::Unsupported("non-string dictionary keys").into());
    }
    Ok(encoded[delim_pos + 1..].to_vec())
}

impl<'a, 'w, W: Write> serde::ser::SerializeMap for SerializeDict<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<(), Self::Error>
    where
        T: serde::Serialize,
    {
        self.pending_key = Some(raw_key(to_bytes(key)?)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: serde::Serialize,
    {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| Error::from(ErrorKind::Custom("dictionary value without a key".into())))?;
        self.entries.push((key, to_bytes(value)?));
        Ok(())
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> serde::ser::SerializeStruct for SerializeDict<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: serde::Serialize,
    {
        self.entries.push((key.as_bytes().to_vec(), to_bytes(value)?));
        Ok(())
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> serde::ser::SerializeStructVariant for SerializeDict<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: Serialize,
    {
        serde::ser::SerializeStruct::serialize_field(self, key, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.finish()
    }
}

pub struct SerializeSeq<'a, 'w, W: Write> {
    serializer: &'a mut Serializer<'w, W>,
    closing: &'static [u8],
}

impl<'a, 'w, W: Write> serde::ser::SerializeSeq for SerializeSeq<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: serde::Serialize,
    {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.serializer.write(self.closing)
    }
}

impl<'a, 'w, W: Write> serde::ser::SerializeTuple for SerializeSeq<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: Serialize,
    {
        serde::ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        serde::ser::SerializeSeq::end(self)
    }
}

impl<'a, 'w, W: Write> serde::ser::SerializeTupleStruct for SerializeSeq<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: Serialize,
    {
        serde::ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        serde::ser::SerializeSeq::end(self)
    }
}

impl<'a, 'w, W: Write> serde::ser::SerializeTupleVariant for SerializeSeq<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: Serialize,
    {
        serde::ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        serde::ser::SerializeSeq::end(self)
    }
}

impl<'a, 'w, W: Write> serde::ser::Serializer for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    type SerializeTuple = SerializeSeq<'a, 'w, W>;
    type SerializeTupleStruct = SerializeSeq<'a, 'w, W>;
    type SerializeTupleVariant = SerializeSeq<'a, 'w, W>;
    type SerializeSeq = SerializeSeq<'a, 'w, W>;
    type SerializeMap = SerializeDict<'a, 'w, W>;
    type SerializeStruct = SerializeDict<'a, 'w, W>;
    type SerializeStructVariant = SerializeDict<'a, 'w, W>;

    fn serialize_bool(self, _v: bool) -> Result<Self::Ok, Self::Error> {
        Err(ErrorKind::Unsupported("bool").into())
    }

    fn serialize_i8(self, v: i8) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Self::Ok, Self::Error> {
        write!(self.output, "i{v}e")?;
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok, Self::Error> {
        write!(self.output, "i{v}e")?;
        Ok(())
    }

    fn serialize_f32(self, _v: f32) -> Result<Self::Ok, Self::Error> {
        Err(ErrorKind::Unsupported("f32").into())
    }

    fn serialize_f64(self, _v: f64) -> Result<Self::Ok, Self::Error> {
        Err(ErrorKind::Unsupported("f64").into())
    }

    fn serialize_char(self, v: char) -> Result<Self::Ok, Self::Error> {
        let mut buf = [0; 4];
        self.serialize_str(v.encode_utf8(&mut buf))
    }

    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        self.write_byte_string(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        self.write_byte_string(v)
    }

    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        self.serialize_str("")
    }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Self::Ok, Self::Error>
    where
        T: serde::Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        self.serialize_str("")
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Self::Ok, Self::Error> {
        self.serialize_str("")
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        self.write(b"d")?;
        self.write_byte_string(variant.as_bytes())?;
        self.write(b"0:e")
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<Self::Ok, Self::Error>
    where
        T: serde::Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error>
    where
        T: serde::Serialize,
    {
        self.write(b"d")?;
        self.write_byte_string(variant.as_bytes())?;
        value.serialize(&mut *self)?;
        self.write(b"e")
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        self.write(b"l")?;
        Ok(SerializeSeq {
            serializer: self,
            closing: b"e",
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        self.write(b"d")?;
        self.write_byte_string(variant.as_bytes())?;
        self.write(b"l")?;
        Ok(SerializeSeq {
            serializer: self,
            closing: b"ee",
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Ok(SerializeDict::new(self, b"e"))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, Self::Error> {
        Ok(SerializeDict::new(self, b"e"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        self.write(b"d")?;
        self.write_byte_string(variant.as_bytes())?;
        Ok(SerializeDict::new(self, b"ee"))
    }
}

pub fn to_bytes<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buff = Vec::new();
    to_writer(value, &mut buff)?;
    Ok(buff)
}

pub fn to_string<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, Error> {
    String::from_utf8(to_bytes(value)?).map_err(|e| ErrorKind::Custom(e.to_string()).into())
}

pub fn to_writer<T: serde::Serialize + ?Sized, W: Write>(value: &T, writer: &mut W) -> Result<(), Error> {
    let mut serializer = Serializer::new(writer);
    value.serialize(&mut serializer)
}
