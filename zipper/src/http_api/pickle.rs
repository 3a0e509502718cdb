// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A minimal Python pickle protocol-2 encoder.
//!
//! `format=pickle` is one of the three response serializations the render/find APIs accept
//! (alongside protobuf and JSON), inherited from Graphite's carbonapi wire contract. There is no
//! pickle crate in wide enough use to justify a dependency for what is, in protocol 2, a short
//! fixed opcode set; this covers exactly the value shapes the handlers above produce: lists,
//! dicts with string keys, strings, ints, floats, bools, and `None`.

const PROTO: u8 = 0x80;
const PROTO_VERSION: u8 = 2;
const STOP: u8 = b'.';
const EMPTY_LIST: u8 = b']';
const EMPTY_DICT: u8 = b'}';
const MARK: u8 = b'(';
const APPENDS: u8 = b'e';
const SETITEMS: u8 = b'u';
const BINUNICODE: u8 = b'X';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BINFLOAT: u8 = b'G';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const NONE: u8 = b'N';

pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub fn dict(entries: Vec<(&'static str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = vec![PROTO, PROTO_VERSION];
    write_value(&mut out, value);
    out.push(STOP);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::None => out.push(NONE),
        Value::Bool(true) => out.push(NEWTRUE),
        Value::Bool(false) => out.push(NEWFALSE),
        Value::Int(n) => write_int(out, *n),
        Value::Float(f) => {
            out.push(BINFLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::String(s) => write_string(out, s),
        Value::List(items) => write_list(out, items),
        Value::Dict(entries) => write_dict(out, entries),
    }
}

fn write_int(out: &mut Vec<u8>, n: i64) {
    if (0..=255).contains(&n) {
        out.push(BININT1);
        out.push(n as u8);
    } else if i32::try_from(n).is_ok() {
        out.push(BININT);
        out.extend_from_slice(&(n as i32).to_le_bytes());
    } else {
        // Outside pickle's 4-byte BININT range: encode as a float rather than pulling in a
        // long-integer opcode path this API surface never needs.
        out.push(BINFLOAT);
        out.extend_from_slice(&(n as f64).to_be_bytes());
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(BINUNICODE);
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_list(out: &mut Vec<u8>, items: &[Value]) {
    out.push(EMPTY_LIST);
    if items.is_empty() {
        return;
    }
    out.push(MARK);
    for item in items {
        write_value(out, item);
    }
    out.push(APPENDS);
}

fn write_dict(out: &mut Vec<u8>, entries: &[(String, Value)]) {
    out.push(EMPTY_DICT);
    if entries.is_empty() {
        return;
    }
    out.push(MARK);
    for (key, value) in entries {
        write_string(out, key);
        write_value(out, value);
    }
    out.push(SETITEMS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_proto_header_and_stop() {
        let bytes = encode(&Value::None);
        assert_eq!(bytes[0], PROTO);
        assert_eq!(bytes[1], PROTO_VERSION);
        assert_eq!(*bytes.last().unwrap(), STOP);
    }

    #[test]
    fn encodes_small_int_as_binint1() {
        let bytes = encode(&Value::Int(42));
        assert_eq!(&bytes[2..4], &[BININT1, 42]);
    }

    #[test]
    fn encodes_empty_list() {
        let bytes = encode(&Value::List(vec![]));
        assert_eq!(&bytes[2..4], &[EMPTY_LIST, STOP]);
    }

    #[test]
    fn encodes_dict_with_one_entry() {
        let bytes = encode(&Value::dict(vec![("path", Value::String("a.b".to_owned()))]));
        assert_eq!(bytes[2], EMPTY_DICT);
        assert_eq!(bytes[3], MARK);
        assert_eq!(bytes[4], BINUNICODE);
    }
}
