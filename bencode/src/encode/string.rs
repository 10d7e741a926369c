use serde::ser;
use crate::error::Error;

// Serializes a map/struct key down to its raw bytes, without bencode framing.
// Dictionary keys must be byte strings, so only str/bytes/char variants are supported.
pub struct StringSerializer;

macro_rules! unsupported_key {
    ($name:ident, $ty:ty) => {
        fn $name(self, _v: $ty) -> Result<Self::Ok, Self::Error> {
            Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
        }
    };
}

impl ser::Serializer for StringSerializer {
    type Ok = Vec<u8>;
    type Error = Error;

    type SerializeSeq = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        Ok(v.to_vec())
    }

    fn serialize_char(self, v: char) -> Result<Self::Ok, Self::Error> {
        let mut buf = [0; 4];
        Ok(v.encode_utf8(&mut buf).as_bytes().to_vec())
    }

    unsupported_key!(serialize_bool, bool);
    unsupported_key!(serialize_i8, i8);
    unsupported_key!(serialize_i16, i16);
    unsupported_key!(serialize_i32, i32);
    unsupported_key!(serialize_i64, i64);
    unsupported_key!(serialize_u8, u8);
    unsupported_key!(serialize_u16, u16);
    unsupported_key!(serialize_u32, u32);
    unsupported_key!(serialize_u64, u64);
    unsupported_key!(serialize_f32, f32);
    unsupported_key!(serialize_f64, f64);

    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Self::Ok, Self::Error>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Self::Ok, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        Ok(variant.as_bytes().to_vec())
    }

    fn serialize_newtype_struct<T: ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Self::Ok, Self::Error>
        where T: serde::Serialize
    {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Err(Error::InvalidType("map keys must be strings or byte strings".to_string()))
    }
}
