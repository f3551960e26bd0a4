mod de;
mod error;
mod ser;
mod value;

pub use de::{from_bytes, from_str, BencodeDeserializer};
pub use error::{Error, ErrorKind};
pub use ser::{to_bytes, to_string, to_writer, Serializer};
pub use value::{BencodeValue, Bytes};
