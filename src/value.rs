// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Typed wire values exchanged with the stub service.
// Every value knows its type signature, which is what reply-shape checks
// compare against ("(o)", "()", "a{sa{sv}}", ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Signature of a connection profile: setting name -> key -> variant.
pub const PROFILE_SIGNATURE: &str = "a{sa{sv}}";

/// Setting name -> key -> value. The inner values travel as variants.
pub type Settings = BTreeMap<String, BTreeMap<String, Value>>;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A marshalled value as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    StrArray(Vec<String>),
    Variant(Box<Value>),
    Tuple(Vec<Value>),
    /// `a{sv}`
    VarDict(BTreeMap<String, Value>),
    /// `a{sa{sv}}`
    Settings(Settings),
}

impl Value {
    /// The empty tuple `()`, the reply of methods without return values.
    pub fn unit() -> Self {
        Value::Tuple(Vec::new())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn object_path(p: impl Into<String>) -> Self {
        Value::ObjectPath(p.into())
    }

    pub fn variant(v: Value) -> Self {
        Value::Variant(Box::new(v))
    }

    /// Type signature of this value.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Bool(_) => out.push('b'),
            Value::Int32(_) => out.push('i'),
            Value::UInt32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::UInt64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::Str(_) => out.push('s'),
            Value::ObjectPath(_) => out.push('o'),
            Value::Bytes(_) => out.push_str("ay"),
            Value::StrArray(_) => out.push_str("as"),
            Value::Variant(_) => out.push('v'),
            Value::Tuple(items) => {
                out.push('(');
                for item in items {
                    item.write_signature(out);
                }
                out.push(')');
            }
            Value::VarDict(_) => out.push_str("a{sv}"),
            Value::Settings(_) => out.push_str(PROFILE_SIGNATURE),
        }
    }

    /// Whether the value has `signature` and is well formed.
    pub fn is_of_type(&self, signature: &str) -> bool {
        self.is_well_formed() && self.signature() == signature
    }

    /// Dictionary values typed `v` must actually be variants; the
    /// signature alone is taken from the container.
    pub fn is_well_formed(&self) -> bool {
        let all_variants = |m: &BTreeMap<String, Value>| {
            m.values().all(|v| matches!(v, Value::Variant(_)) && v.is_well_formed())
        };
        match self {
            Value::Variant(inner) => inner.is_well_formed(),
            Value::Tuple(items) => items.iter().all(Value::is_well_formed),
            Value::VarDict(map) => all_variants(map),
            Value::Settings(settings) => settings.values().all(all_variants),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Tuple members, or `None` for non-tuples.
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Unwrap any number of variant layers.
    pub fn peel(&self) -> &Value {
        let mut v = self;
        while let Value::Variant(inner) = v {
            v = inner;
        }
        v
    }

    /// Extract the object path from a `(o)` reply.
    pub fn single_object_path(&self) -> Option<&str> {
        match self.items()? {
            [Value::ObjectPath(p)] => Some(p),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionProfile
// ---------------------------------------------------------------------------

/// A domain connection object that can be marshalled into a profile.
pub trait ConnectionProfile {
    /// Serialize every setting.
    fn to_settings(&self) -> Settings;

    /// Object path the connection is exported at, if it has one.
    fn path(&self) -> Option<&str> {
        None
    }
}

impl ConnectionProfile for Settings {
    fn to_settings(&self) -> Settings {
        self.clone()
    }
}
