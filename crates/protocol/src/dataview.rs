//! Self-describing nested key/value documents
//!
//! A [`DataView`] is the structured payload attachment some messages carry:
//! string keys mapped to tagged values, nesting allowed. On the wire each
//! entry is `tag byte + key string + value`, terminated by a zero tag. An
//! optional view is guarded by a presence boolean.
//!
//! Decoding is bounded: unknown tags and over-deep nesting are decode errors,
//! and every read checks the remaining buffer first.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::{ProtocolError, Result};

/// Maximum nesting depth the decoder will follow.
pub const MAX_VIEW_DEPTH: usize = 32;

const TAG_END: u8 = 0;
const TAG_BYTE: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_VIEW: u8 = 7;

/// A single value inside a [`DataView`].
#[derive(Debug, Clone, PartialEq)]
pub enum ViewValue {
    Byte(i8),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    List(Vec<ViewValue>),
    View(DataView),
}

impl ViewValue {
    fn tag(&self) -> u8 {
        match self {
            ViewValue::Byte(_) => TAG_BYTE,
            ViewValue::Int(_) => TAG_INT,
            ViewValue::Long(_) => TAG_LONG,
            ViewValue::Double(_) => TAG_DOUBLE,
            ViewValue::Text(_) => TAG_TEXT,
            ViewValue::List(_) => TAG_LIST,
            ViewValue::View(_) => TAG_VIEW,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ViewValue::Byte(v) => buf.put_i8(*v),
            ViewValue::Int(v) => buf.put_i32(*v),
            ViewValue::Long(v) => buf.put_i64(*v),
            ViewValue::Double(v) => buf.put_f64(*v),
            ViewValue::Text(v) => codec::write_string(buf, v),
            ViewValue::List(items) => {
                codec::write_var_int(buf, items.len() as i32);
                for item in items {
                    buf.put_u8(item.tag());
                    item.encode(buf);
                }
            }
            ViewValue::View(view) => view.encode(buf),
        }
    }

    fn decode(tag: u8, buf: &mut Bytes, depth: usize) -> Result<ViewValue> {
        if depth > MAX_VIEW_DEPTH {
            return Err(ProtocolError::ViewTooDeep(MAX_VIEW_DEPTH));
        }
        Ok(match tag {
            TAG_BYTE => ViewValue::Byte(codec::read_u8(buf)? as i8),
            TAG_INT => ViewValue::Int(codec::read_i32(buf)?),
            TAG_LONG => ViewValue::Long(codec::read_i64(buf)?),
            TAG_DOUBLE => ViewValue::Double(codec::read_f64(buf)?),
            TAG_TEXT => ViewValue::Text(codec::read_string(buf, codec::DEFAULT_STRING_CAP)?),
            TAG_LIST => {
                let count = codec::read_var_int(buf)?;
                if count < 0 {
                    return Err(ProtocolError::MalformedFrame("negative list length"));
                }
                let mut items = Vec::new();
                for _ in 0..count {
                    let item_tag = codec::read_u8(buf)?;
                    items.push(ViewValue::decode(item_tag, buf, depth + 1)?);
                }
                ViewValue::List(items)
            }
            TAG_VIEW => ViewValue::View(DataView::decode_at_depth(buf, depth + 1)?),
            other => return Err(ProtocolError::UnknownViewTag(other)),
        })
    }
}

/// An ordered key/value document carried inside a message payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataView {
    entries: BTreeMap<String, ViewValue>,
}

impl DataView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ViewValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ViewValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        for (key, value) in &self.entries {
            buf.put_u8(value.tag());
            codec::write_string(buf, key);
            value.encode(buf);
        }
        buf.put_u8(TAG_END);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &mut Bytes, depth: usize) -> Result<Self> {
        if depth > MAX_VIEW_DEPTH {
            return Err(ProtocolError::ViewTooDeep(MAX_VIEW_DEPTH));
        }
        let mut view = DataView::new();
        loop {
            let tag = codec::read_u8(buf)?;
            if tag == TAG_END {
                return Ok(view);
            }
            let key = codec::read_string(buf, codec::DEFAULT_STRING_CAP)?;
            let value = ViewValue::decode(tag, buf, depth)?;
            view.entries.insert(key, value);
        }
    }

    /// Encodes `view` behind a presence boolean.
    pub fn encode_optional(view: Option<&DataView>, buf: &mut BytesMut) {
        match view {
            Some(view) => {
                codec::write_bool(buf, true);
                view.encode(buf);
            }
            None => codec::write_bool(buf, false),
        }
    }

    /// Decodes an optional view guarded by a presence boolean.
    pub fn decode_optional(buf: &mut Bytes) -> Result<Option<DataView>> {
        if codec::read_bool(buf)? {
            Ok(Some(DataView::decode(buf)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataView {
        let mut inner = DataView::new();
        inner.insert("id", ViewValue::Int(42));
        let mut view = DataView::new();
        view.insert("name", ViewValue::Text("stone".into()));
        view.insert("hardness", ViewValue::Double(1.5));
        view.insert(
            "drops",
            ViewValue::List(vec![ViewValue::Byte(1), ViewValue::Byte(4)]),
        );
        view.insert("meta", ViewValue::View(inner));
        view
    }

    #[test]
    fn nested_roundtrip() {
        let view = sample();
        let mut buf = BytesMut::new();
        view.encode(&mut buf);
        let decoded = DataView::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, view);
    }

    #[test]
    fn optional_presence_boolean() {
        let mut buf = BytesMut::new();
        DataView::encode_optional(None, &mut buf);
        DataView::encode_optional(Some(&sample()), &mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(DataView::decode_optional(&mut bytes).unwrap(), None);
        assert_eq!(DataView::decode_optional(&mut bytes).unwrap(), Some(sample()));
    }

    #[test]
    fn truncated_view_is_a_decode_error() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        let mut truncated = buf.freeze().slice(0..10);
        assert!(DataView::decode(&mut truncated).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Bytes::from_static(&[0x63]);
        assert!(matches!(
            DataView::decode(&mut bytes),
            Err(ProtocolError::UnknownViewTag(0x63))
        ));
    }
}
