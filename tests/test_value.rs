// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for wire values: signatures, accessors, profile marshalling.

use std::collections::BTreeMap;

use stubharness::value::{ConnectionProfile, Settings, Value, PROFILE_SIGNATURE};

fn profile(id: &str) -> Settings {
    let mut connection = BTreeMap::new();
    connection.insert("id".to_owned(), Value::variant(Value::str(id)));
    connection.insert("uuid".to_owned(), Value::variant(Value::str("0000-1111")));
    let mut settings = Settings::new();
    settings.insert("connection".to_owned(), connection);
    settings
}

// ===========================================================================
// Signatures
// ===========================================================================

#[test]
fn scalar_signatures() {
    assert_eq!(Value::Bool(true).signature(), "b");
    assert_eq!(Value::Int32(-1).signature(), "i");
    assert_eq!(Value::UInt64(1).signature(), "t");
    assert_eq!(Value::str("x").signature(), "s");
    assert_eq!(Value::object_path("/a").signature(), "o");
    assert_eq!(Value::Bytes(vec![1, 2]).signature(), "ay");
}

#[test]
fn tuple_signatures() {
    assert_eq!(Value::unit().signature(), "()");
    let reply = Value::Tuple(vec![Value::object_path("/org/x/1")]);
    assert!(reply.is_of_type("(o)"));

    let wired = Value::Tuple(vec![
        Value::str("eth0"),
        Value::str("/"),
        Value::StrArray(Vec::new()),
    ]);
    assert_eq!(wired.signature(), "(ssas)");

    let add = Value::Tuple(vec![Value::variant(Value::Settings(profile("a"))), Value::Bool(true)]);
    assert_eq!(add.signature(), "(vb)");
}

#[test]
fn settings_signature_matches_profile_shape() {
    assert_eq!(Value::Settings(Settings::new()).signature(), PROFILE_SIGNATURE);
    assert!(!Value::VarDict(BTreeMap::new()).is_of_type(PROFILE_SIGNATURE));
}

#[test]
fn dictionary_values_must_be_variants() {
    assert!(Value::Settings(profile("ok")).is_well_formed());

    let mut bare = profile("bare");
    if let Some(connection) = bare.get_mut("connection") {
        connection.insert("id".to_owned(), Value::str("not-a-variant"));
    }
    let bare = Value::Settings(bare);
    assert_eq!(bare.signature(), PROFILE_SIGNATURE);
    assert!(!bare.is_well_formed());
    assert!(!bare.is_of_type(PROFILE_SIGNATURE));

    let mut map = BTreeMap::new();
    map.insert("/dev/1".to_owned(), Value::str("eth0"));
    assert!(!Value::VarDict(map.clone()).is_well_formed());
    map.insert("/dev/1".to_owned(), Value::variant(Value::str("eth0")));
    assert!(Value::VarDict(map.clone()).is_well_formed());
    assert!(Value::Tuple(vec![Value::VarDict(map)]).is_of_type("(a{sv})"));
}

// ===========================================================================
// Accessors
// ===========================================================================

#[test]
fn single_object_path_only_for_o_tuples() {
    let reply = Value::Tuple(vec![Value::object_path("/dev/1")]);
    assert_eq!(reply.single_object_path(), Some("/dev/1"));

    assert_eq!(Value::unit().single_object_path(), None);
    assert_eq!(Value::Tuple(vec![Value::str("/dev/1")]).single_object_path(), None);
    assert_eq!(Value::object_path("/dev/1").single_object_path(), None);
}

#[test]
fn peel_unwraps_nested_variants() {
    let v = Value::variant(Value::variant(Value::Bool(true)));
    assert_eq!(v.peel().as_bool(), Some(true));
    assert_eq!(Value::str("x").peel().as_str(), Some("x"));
}

#[test]
fn serde_keeps_object_paths_distinct_from_strings() {
    let v = Value::Tuple(vec![Value::object_path("/p"), Value::str("/p")]);
    let text = serde_json::to_string(&v).expect("encode");
    let back: Value = serde_json::from_str(&text).expect("decode");
    assert_eq!(back, v);
    assert_eq!(back.signature(), "(os)");
}

// ===========================================================================
// ConnectionProfile
// ===========================================================================

struct Exported {
    path: String,
    settings: Settings,
}

impl ConnectionProfile for Exported {
    fn to_settings(&self) -> Settings {
        self.settings.clone()
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }
}

#[test]
fn settings_are_a_profile_without_path() {
    let s = profile("plain");
    assert_eq!(s.to_settings(), s);
    assert_eq!(s.path(), None);
}

#[test]
fn exported_profile_carries_path() {
    let e = Exported { path: "/org/x/Settings/3".to_owned(), settings: profile("exp") };
    assert_eq!(e.path(), Some("/org/x/Settings/3"));
    assert!(Value::Settings(e.to_settings()).is_of_type(PROFILE_SIGNATURE));
}
