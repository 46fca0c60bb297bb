//! In-memory form of server collection values (sets, multisets and
//! sequences). The payload can be decoded and re-encoded without a live
//! connection, so collection values outlive the request that produced them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{Error, Result};
use crate::value::{Oid, UType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Set,
    Multiset,
    Sequence,
}

/// A decoded collection payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    kind: CollectionKind,
    element_type: UType,
    values: Vec<Value>,
}

const MALFORMED: Error = Error::InvalidArgs("malformed collection payload");

impl Collection {
    pub fn new(kind: CollectionKind, element_type: UType, values: Vec<Value>) -> Self {
        Collection {
            kind,
            element_type,
            values,
        }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn element_type(&self) -> UType {
        self.element_type
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Re-encodes the collection into its wire payload.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(kind_tag(self.kind));
        buf.put_u8(utype_tag(self.element_type));
        buf.put_u32(self.values.len() as u32);
        for value in &self.values {
            match value {
                Value::Null => buf.put_u8(0),
                Value::Int(v) => {
                    buf.put_u8(1);
                    buf.put_i64(*v);
                }
                Value::Float(v) => {
                    buf.put_u8(2);
                    buf.put_f64(*v);
                }
                Value::Str(s) => {
                    buf.put_u8(3);
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                Value::Bytes(b) => {
                    buf.put_u8(4);
                    buf.put_u32(b.len() as u32);
                    buf.put_slice(b);
                }
                Value::Oid(oid) => {
                    buf.put_u8(5);
                    buf.put_i16(oid.volume);
                    buf.put_i32(oid.page);
                    buf.put_i16(oid.slot);
                }
                // nested collections are not representable on the wire
                Value::Collection(_) => return Err(MALFORMED),
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes a wire payload into a collection.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut buf = payload;
        if buf.remaining() < 6 {
            return Err(MALFORMED);
        }
        let kind = kind_from_tag(buf.get_u8())?;
        let element_type = utype_from_tag(buf.get_u8())?;
        let count = buf.get_u32() as usize;
        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(MALFORMED);
            }
            let value = match buf.get_u8() {
                0 => Value::Null,
                1 => {
                    if buf.remaining() < 8 {
                        return Err(MALFORMED);
                    }
                    Value::Int(buf.get_i64())
                }
                2 => {
                    if buf.remaining() < 8 {
                        return Err(MALFORMED);
                    }
                    Value::Float(buf.get_f64())
                }
                3 => {
                    let len = read_len(&mut buf)?;
                    let raw = buf.split_to(len);
                    let s = std::str::from_utf8(&raw).map_err(|_| MALFORMED)?;
                    Value::Str(s.to_owned())
                }
                4 => {
                    let len = read_len(&mut buf)?;
                    Value::Bytes(buf.split_to(len))
                }
                5 => {
                    if buf.remaining() < 8 {
                        return Err(MALFORMED);
                    }
                    Value::Oid(Oid {
                        volume: buf.get_i16(),
                        page: buf.get_i32(),
                        slot: buf.get_i16(),
                    })
                }
                _ => return Err(MALFORMED),
            };
            values.push(value);
        }
        if buf.has_remaining() {
            return Err(MALFORMED);
        }
        Ok(Collection {
            kind,
            element_type,
            values,
        })
    }
}

fn read_len(buf: &mut Bytes) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(MALFORMED);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(MALFORMED);
    }
    Ok(len)
}

fn kind_tag(kind: CollectionKind) -> u8 {
    match kind {
        CollectionKind::Set => 1,
        CollectionKind::Multiset => 2,
        CollectionKind::Sequence => 3,
    }
}

fn kind_from_tag(tag: u8) -> Result<CollectionKind> {
    match tag {
        1 => Ok(CollectionKind::Set),
        2 => Ok(CollectionKind::Multiset),
        3 => Ok(CollectionKind::Sequence),
        _ => Err(MALFORMED),
    }
}

fn utype_tag(u_type: UType) -> u8 {
    match u_type {
        UType::Null => 0,
        UType::Char => 1,
        UType::String => 2,
        UType::Short => 3,
        UType::Int => 4,
        UType::Bigint => 5,
        UType::Float => 6,
        UType::Double => 7,
        UType::Numeric => 8,
        UType::Date => 9,
        UType::Time => 10,
        UType::Timestamp => 11,
        UType::Datetime => 12,
        UType::Object => 13,
        UType::Set => 14,
        UType::Multiset => 15,
        UType::Sequence => 16,
        UType::Blob => 17,
        UType::Clob => 18,
        UType::Bit => 19,
    }
}

fn utype_from_tag(tag: u8) -> Result<UType> {
    Ok(match tag {
        0 => UType::Null,
        1 => UType::Char,
        2 => UType::String,
        3 => UType::Short,
        4 => UType::Int,
        5 => UType::Bigint,
        6 => UType::Float,
        7 => UType::Double,
        8 => UType::Numeric,
        9 => UType::Date,
        10 => UType::Time,
        11 => UType::Timestamp,
        12 => UType::Datetime,
        13 => UType::Object,
        14 => UType::Set,
        15 => UType::Multiset,
        16 => UType::Sequence,
        17 => UType::Blob,
        18 => UType::Clob,
        19 => UType::Bit,
        _ => return Err(MALFORMED),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Collection {
        Collection::new(
            CollectionKind::Sequence,
            UType::Int,
            vec![
                Value::Int(1),
                Value::Null,
                Value::Str("three".into()),
                Value::Oid(Oid {
                    volume: 0,
                    page: 99,
                    slot: 1,
                }),
            ],
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let coll = sample();
        let decoded = Collection::decode(coll.encode().unwrap()).unwrap();
        assert_eq!(decoded, coll);
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = sample().encode().unwrap();
        let truncated = bytes.slice(..bytes.len() - 2);
        assert!(Collection::decode(truncated).is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = BytesMut::from(&sample().encode().unwrap()[..]);
        bytes.put_u8(7);
        assert!(Collection::decode(bytes.freeze()).is_err());
    }

    #[test]
    fn rejects_nested_collections() {
        let nested = Collection::new(
            CollectionKind::Set,
            UType::Set,
            vec![Value::Collection(sample())],
        );
        assert!(nested.encode().is_err());
    }
}
