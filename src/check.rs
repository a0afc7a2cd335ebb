//! Structural validation walker.
//!
//! A [`Checker`] walks a configuration or request object, carrying the
//! current [`Pointer`] and accumulating [`ValidationError`]s. Domain types
//! implement [`Object`] to describe their own constraints; the typed check
//! methods record one error with a stable code on failure and return whether
//! the check passed.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::pointer::Pointer;

/// A single pointer token, built from a string or a decimal index.
#[derive(Debug, Clone)]
pub struct Token(String);

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<usize> for Token {
    fn from(i: usize) -> Self {
        Self(i.to_string())
    }
}

/// A validation failure tagged with the pointer of the offending value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub pointer: Pointer,
    pub code: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.pointer, self.code, self.message)
    }
}

/// An ordered collection of validation failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in &self.0 {
            writeln!(f, "{err}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// A type that can describe its own validation constraints.
pub trait Object {
    fn check(&self, c: &mut Checker);
}

/// Mutable validation walker.
#[derive(Debug, Default)]
pub struct Checker {
    pointer: Pointer,
    errors: Vec<ValidationError>,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pointer currently being walked.
    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn into_errors(self) -> ValidationErrors {
        ValidationErrors(self.errors)
    }

    /// Convert the accumulated state into a result.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }

    pub fn push(&mut self, token: impl Into<Token>) {
        self.pointer.push(token.into().0);
    }

    pub fn pop(&mut self) {
        self.pointer.pop();
    }

    /// Run `f` with the pointer extended by `token`, restoring it afterwards.
    pub fn with_child<R>(&mut self, token: impl Into<Token>, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push(token);
        let r = f(self);
        self.pop();
        r
    }

    /// Record an error at the current pointer extended by `token`.
    pub fn add_error(
        &mut self,
        token: impl Into<Token>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        let pointer = self.pointer.child([token.into().0]);

        self.errors.push(ValidationError {
            pointer,
            code: code.into(),
            message: message.into(),
        });
    }

    /// Record an error unless `ok` holds; returns `ok`.
    pub fn check(
        &mut self,
        token: impl Into<Token>,
        ok: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        if !ok {
            self.add_error(token, code, message);
        }

        ok
    }

    pub fn check_int_min(&mut self, token: impl Into<Token>, i: i64, min: i64) -> bool {
        self.check(
            token,
            i >= min,
            "integer_too_small",
            format!("integer {i} must be greater or equal to {min}"),
        )
    }

    pub fn check_int_max(&mut self, token: impl Into<Token>, i: i64, max: i64) -> bool {
        self.check(
            token,
            i <= max,
            "integer_too_large",
            format!("integer {i} must be lower or equal to {max}"),
        )
    }

    pub fn check_int_min_max(&mut self, token: impl Into<Token>, i: i64, min: i64, max: i64) -> bool {
        let token = token.into();

        if !self.check_int_min(token.clone(), i, min) {
            return false;
        }

        self.check_int_max(token, i, max)
    }

    pub fn check_float_min(&mut self, token: impl Into<Token>, f: f64, min: f64) -> bool {
        self.check(
            token,
            f >= min,
            "float_too_small",
            format!("float {f} must be greater or equal to {min}"),
        )
    }

    pub fn check_float_max(&mut self, token: impl Into<Token>, f: f64, max: f64) -> bool {
        self.check(
            token,
            f <= max,
            "float_too_large",
            format!("float {f} must be lower or equal to {max}"),
        )
    }

    pub fn check_float_min_max(
        &mut self,
        token: impl Into<Token>,
        f: f64,
        min: f64,
        max: f64,
    ) -> bool {
        let token = token.into();

        if !self.check_float_min(token.clone(), f, min) {
            return false;
        }

        self.check_float_max(token, f, max)
    }

    pub fn check_string_length_min(&mut self, token: impl Into<Token>, s: &str, min: usize) -> bool {
        self.check(
            token,
            s.len() >= min,
            "string_too_small",
            format!("string length must be greater or equal to {min}"),
        )
    }

    pub fn check_string_length_max(&mut self, token: impl Into<Token>, s: &str, max: usize) -> bool {
        self.check(
            token,
            s.len() <= max,
            "string_too_large",
            format!("string length must be lower or equal to {max}"),
        )
    }

    pub fn check_string_length_min_max(
        &mut self,
        token: impl Into<Token>,
        s: &str,
        min: usize,
        max: usize,
    ) -> bool {
        let token = token.into();

        if !self.check_string_length_min(token.clone(), s, min) {
            return false;
        }

        self.check_string_length_max(token, s, max)
    }

    pub fn check_string_not_empty(&mut self, token: impl Into<Token>, s: &str) -> bool {
        self.check(
            token,
            !s.is_empty(),
            "empty_string",
            "string must not be empty",
        )
    }

    /// Check that `s` is one of the allowed values; the message enumerates
    /// the full set.
    pub fn check_string_value<T: AsRef<str>>(
        &mut self,
        token: impl Into<Token>,
        s: &str,
        values: &[T],
    ) -> bool {
        let found = values.iter().any(|v| v.as_ref() == s);

        if !found {
            let list = values
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(", ");

            self.add_error(
                token,
                "invalid_value",
                format!("value must be one of the following strings: {list}"),
            );
        }

        found
    }

    pub fn check_string_match(&mut self, token: impl Into<Token>, s: &str, re: &Regex) -> bool {
        self.check(
            token,
            re.is_match(s),
            "invalid_string_format",
            format!("string must match the following regular expression: {re}"),
        )
    }

    /// Check that `s` is a valid URI. The empty string is rejected with its
    /// own code since URL parsers tend to accept it.
    pub fn check_string_uri(&mut self, token: impl Into<Token>, s: &str) -> bool {
        if s.is_empty() {
            self.add_error(token, "empty_uri", "string must be a valid uri");
            return false;
        }

        if Url::parse(s).is_err() {
            self.add_error(token, "invalid_uri_format", "string must be a valid uri");
            return false;
        }

        true
    }

    pub fn check_array_length_min<T>(
        &mut self,
        token: impl Into<Token>,
        values: &[T],
        min: usize,
    ) -> bool {
        self.check(
            token,
            values.len() >= min,
            "array_too_small",
            format!("array must contain {min} or more elements"),
        )
    }

    pub fn check_array_length_max<T>(
        &mut self,
        token: impl Into<Token>,
        values: &[T],
        max: usize,
    ) -> bool {
        self.check(
            token,
            values.len() <= max,
            "array_too_large",
            format!("array must contain {max} or less elements"),
        )
    }

    pub fn check_array_length_min_max<T>(
        &mut self,
        token: impl Into<Token>,
        values: &[T],
        min: usize,
        max: usize,
    ) -> bool {
        let token = token.into();

        if !self.check_array_length_min(token.clone(), values, min) {
            return false;
        }

        self.check_array_length_max(token, values, max)
    }

    pub fn check_array_not_empty<T>(&mut self, token: impl Into<Token>, values: &[T]) -> bool {
        self.check(
            token,
            !values.is_empty(),
            "empty_array",
            "array must not be empty",
        )
    }

    /// Check a mandatory nested object: absence is a `missing_value` error,
    /// presence delegates to the object's own checks under `token`.
    pub fn check_object<T: Object>(&mut self, token: impl Into<Token>, value: Option<&T>) -> bool {
        let token = token.into();

        match value {
            None => {
                self.add_error(token, "missing_value", "missing value");
                false
            }

            Some(obj) => self.do_check_object(token, obj),
        }
    }

    /// Check an optional nested object: absence is a success.
    pub fn check_optional_object<T: Object>(
        &mut self,
        token: impl Into<Token>,
        value: Option<&T>,
    ) -> bool {
        let token = token.into();

        match value {
            None => true,
            Some(obj) => self.do_check_object(token, obj),
        }
    }

    fn do_check_object<T: Object>(&mut self, token: Token, obj: &T) -> bool {
        let nb_errors = self.errors.len();

        self.with_child(token, |c| obj.check(c));

        self.errors.len() == nb_errors
    }

    /// Check every element of a slice, each under its decimal index.
    pub fn check_object_array<T: Object>(&mut self, token: impl Into<Token>, values: &[T]) -> bool {
        self.with_child(token, |c| {
            let mut ok = true;

            for (i, obj) in values.iter().enumerate() {
                ok = c.do_check_object(Token::from(i), obj) && ok;
            }

            ok
        })
    }

    /// Check every value of a map, each under its key. Iteration order is
    /// not deterministic.
    pub fn check_object_map<T: Object>(
        &mut self,
        token: impl Into<Token>,
        values: &HashMap<String, T>,
    ) -> bool {
        self.with_child(token, |c| {
            let mut ok = true;

            for (key, obj) in values {
                ok = c.do_check_object(Token::from(key.clone()), obj) && ok;
            }

            ok
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestObj1 {
        a: Option<TestObj2>,
        b: Option<TestObj2>,
    }

    impl Object for TestObj1 {
        fn check(&self, c: &mut Checker) {
            c.check_object("a", self.a.as_ref());
            c.check_optional_object("b", self.b.as_ref());
        }
    }

    struct TestObj2 {
        c: i64,
    }

    impl Object for TestObj2 {
        fn check(&self, c: &mut Checker) {
            c.check_int_min("c", self.c, 1);
        }
    }

    fn ptr(tokens: &[&str]) -> Pointer {
        Pointer::from_tokens(tokens.iter().copied())
    }

    #[test]
    fn test_integers() {
        let mut c = Checker::new();
        assert!(c.check_int_min("t", 42, 1));
        assert!(c.check_int_max("t", 42, 100));
        assert!(c.check_int_min_max("t", 42, 1, 100));
        assert!(!c.check_int_min_max("t", 42, 100, 120));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].pointer, ptr(&["t"]));
        assert_eq!(c.errors()[0].code, "integer_too_small");
    }

    #[test]
    fn test_floats() {
        let mut c = Checker::new();
        assert!(c.check_float_min("t", 1.5, 1.0));
        assert!(c.check_float_max("t", 1.5, 2.0));
        assert!(!c.check_float_min_max("t", 3.5, 1.0, 2.0));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].code, "float_too_large");
    }

    #[test]
    fn test_strings() {
        let mut c = Checker::new();
        assert!(c.check_string_length_min("t", "foo", 1));
        assert!(c.check_string_length_max("t", "foo", 10));
        assert!(c.check_string_length_min_max("t", "foo", 1, 10));
        assert!(!c.check_string_length_min_max("t", "foo", 5, 10));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].pointer, ptr(&["t"]));

        let mut c = Checker::new();
        assert!(c.check_string_not_empty("t", "x"));
        assert!(!c.check_string_not_empty("t", ""));
        assert_eq!(c.errors()[0].code, "empty_string");

        let mut c = Checker::new();
        assert!(c.check_string_value("t", "x", &["x", "y", "z"]));
        assert!(!c.check_string_value("t", "w", &["x", "y", "z"]));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].code, "invalid_value");
        assert!(c.errors()[0].message.contains("x, y, z"));

        let mut c = Checker::new();
        let re = Regex::new("^x").unwrap();
        assert!(c.check_string_match("t", "x1", &re));
        assert!(!c.check_string_match("t", "y1", &re));
        assert_eq!(c.errors()[0].code, "invalid_string_format");
    }

    #[test]
    fn test_uris() {
        let mut c = Checker::new();
        assert!(c.check_string_uri("t", "http://example.com"));
        assert!(!c.check_string_uri("t", ""));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].code, "empty_uri");

        let mut c = Checker::new();
        assert!(!c.check_string_uri("t", "://nope"));
        assert_eq!(c.errors()[0].code, "invalid_uri_format");
    }

    #[test]
    fn test_arrays() {
        let mut c = Checker::new();
        assert!(c.check_array_length_min("t", &[1, 2, 3], 1));
        assert!(c.check_array_length_max("t", &[1, 2, 3], 10));
        assert!(c.check_array_length_min_max("t", &[1, 2, 3], 1, 10));
        assert!(!c.check_array_length_min_max("t", &[1, 2, 3], 5, 10));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].code, "array_too_small");

        let mut c = Checker::new();
        assert!(!c.check_array_not_empty::<i64>("t", &[]));
        assert_eq!(c.errors()[0].code, "empty_array");
    }

    #[test]
    fn test_path_restoration() {
        let mut c = Checker::new();

        let before = c.pointer().clone();

        c.with_child("a", |c| {
            c.add_error("x", "code", "message");

            c.with_child("b", |c| {
                c.add_error("y", "code", "message");
            });

            assert_eq!(c.pointer(), &ptr(&["a"]));
        });

        assert_eq!(c.pointer(), &before);
        assert_eq!(c.errors()[0].pointer, ptr(&["a", "x"]));
        assert_eq!(c.errors()[1].pointer, ptr(&["a", "b", "y"]));
    }

    #[test]
    fn test_objects() {
        let mut c = Checker::new();
        let obj = TestObj1 {
            a: Some(TestObj2 { c: 1 }),
            b: Some(TestObj2 { c: 2 }),
        };
        assert!(c.check_object("t", Some(&obj)));

        // Nested failure is addressed by its full pointer.
        let mut c = Checker::new();
        let obj = TestObj1 {
            a: Some(TestObj2 { c: 1 }),
            b: Some(TestObj2 { c: 0 }),
        };
        assert!(!c.check_object("t", Some(&obj)));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].pointer, ptr(&["t", "b", "c"]));

        let mut c = Checker::new();
        let obj = TestObj1 {
            a: Some(TestObj2 { c: 1 }),
            b: None,
        };
        assert!(c.check_object("t", Some(&obj)));

        let mut c = Checker::new();
        let obj = TestObj1 {
            a: None,
            b: Some(TestObj2 { c: 1 }),
        };
        assert!(!c.check_object("t", Some(&obj)));
        assert_eq!(c.errors().len(), 1);
        assert_eq!(c.errors()[0].pointer, ptr(&["t", "a"]));
        assert_eq!(c.errors()[0].code, "missing_value");
    }

    #[test]
    fn test_object_array() {
        let mut c = Checker::new();
        let objs = [TestObj2 { c: 1 }, TestObj2 { c: 2 }, TestObj2 { c: 3 }];
        assert!(c.check_object_array("t", &objs));

        let mut c = Checker::new();
        let objs = [
            TestObj2 { c: 1 },
            TestObj2 { c: 2 },
            TestObj2 { c: 0 },
            TestObj2 { c: 3 },
            TestObj2 { c: 0 },
        ];
        assert!(!c.check_object_array("t", &objs));
        assert_eq!(c.errors().len(), 2);
        assert_eq!(c.errors()[0].pointer, ptr(&["t", "2", "c"]));
        assert_eq!(c.errors()[1].pointer, ptr(&["t", "4", "c"]));
    }

    #[test]
    fn test_object_map() {
        let mut c = Checker::new();
        let objs = HashMap::from([
            ("v1".to_string(), TestObj2 { c: 1 }),
            ("v2".to_string(), TestObj2 { c: 2 }),
        ]);
        assert!(c.check_object_map("t", &objs));

        let mut c = Checker::new();
        let objs = HashMap::from([
            ("v1".to_string(), TestObj2 { c: 1 }),
            ("v3".to_string(), TestObj2 { c: 0 }),
            ("v5".to_string(), TestObj2 { c: 0 }),
        ]);
        assert!(!c.check_object_map("t", &objs));

        let mut pointers: Vec<String> = c.errors().iter().map(|e| e.pointer.to_string()).collect();
        pointers.sort();
        assert_eq!(pointers, vec!["/t/v3/c", "/t/v5/c"]);
    }

    #[test]
    fn test_wire_shape() {
        let err = ValidationError {
            pointer: ptr(&["a", "b", "0"]),
            code: "empty_string".to_string(),
            message: "string must not be empty".to_string(),
        };

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "pointer": "/a/b/0",
                "code": "empty_string",
                "message": "string must not be empty",
            })
        );
    }
}
