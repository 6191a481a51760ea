//! DER encoding of entitlements for the slot 7 blob.
//!
//! The payload is `[APPLICATION 16] { INTEGER 1, [CONTEXT 16] dict }` where
//! a dictionary is a SET of `SEQUENCE { UTF8String key, value }` sorted by
//! key, arrays are SEQUENCEs, strings are UTF8String, booleans BOOLEAN and
//! integers INTEGER.

use crate::{Error, Result};
use plist::Value;

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_UTF8STRING: u8 = 0x0c;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
/// Constructed, application class, tag 16
const TAG_APPLICATION_16: u8 = 0x70;
/// Constructed, context class, tag 16
const TAG_CONTEXT_16: u8 = 0xb0;

fn push_length(out: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    push_length(out, content.len());
    out.extend_from_slice(content);
}

/// Minimal two's-complement big-endian bytes.
fn integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Boolean(b) => push_tlv(out, TAG_BOOLEAN, &[if *b { 0xff } else { 0x00 }]),
        Value::Integer(i) => {
            let v = i
                .as_signed()
                .ok_or_else(|| Error::Signing("entitlement integer out of range".into()))?;
            push_tlv(out, TAG_INTEGER, &integer_bytes(v));
        }
        Value::String(s) => push_tlv(out, TAG_UTF8STRING, s.as_bytes()),
        Value::Array(items) => {
            let mut content = Vec::new();
            for item in items {
                encode_value(&mut content, item)?;
            }
            push_tlv(out, TAG_SEQUENCE, &content);
        }
        Value::Dictionary(dict) => {
            let mut keys: Vec<&String> = dict.keys().collect();
            keys.sort();

            let mut content = Vec::new();
            for key in keys {
                let mut pair = Vec::new();
                push_tlv(&mut pair, TAG_UTF8STRING, key.as_bytes());
                if let Some(v) = dict.get(key) {
                    encode_value(&mut pair, v)?;
                }
                push_tlv(&mut content, TAG_SEQUENCE, &pair);
            }
            push_tlv(out, TAG_SET, &content);
        }
        other => {
            return Err(Error::Signing(format!(
                "unsupported entitlement value type: {:?}",
                other
            )))
        }
    }
    Ok(())
}

/// Encode a parsed entitlements dictionary.
pub fn entitlements_to_der(entitlements: &Value) -> Result<Vec<u8>> {
    let mut dict = Vec::new();
    encode_value(&mut dict, entitlements)?;

    let mut body = Vec::new();
    push_tlv(&mut body, TAG_INTEGER, &[1]);
    push_tlv(&mut body, TAG_CONTEXT_16, &dict);

    let mut out = Vec::new();
    push_tlv(&mut out, TAG_APPLICATION_16, &body);
    Ok(out)
}

/// Parse an entitlements plist (XML or binary) and encode it.
pub fn plist_to_der(plist: &[u8]) -> Result<Vec<u8>> {
    let value = Value::from_reader(std::io::Cursor::new(plist))?;
    entitlements_to_der(&value)
}
