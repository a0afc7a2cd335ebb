//! Hierarchical path addressing for structured data and validation errors.
//!
//! A [`Pointer`] is an ordered sequence of string tokens. The textual form is
//! the empty string for the root, otherwise a sequence of `/`-prefixed
//! escaped tokens (`~` is written `~0`, `/` is written `~1`).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pointer parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointerError {
    /// The string is neither empty nor starts with `/`.
    #[error("invalid format")]
    InvalidFormat,
}

/// A path into a tree-structured document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Pointer(Vec<String>);

impl Pointer {
    /// Create an empty pointer designating the document root.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Create a pointer from a list of unescaped tokens.
    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// Parse the textual form of a pointer.
    ///
    /// # Errors
    /// Returns [`PointerError::InvalidFormat`] unless the string is empty or
    /// starts with `/`.
    pub fn parse(s: &str) -> Result<Self, PointerError> {
        if s.is_empty() {
            return Ok(Self::new());
        }

        if !s.starts_with('/') {
            return Err(PointerError::InvalidFormat);
        }

        let tokens = s[1..].split('/').map(decode_token).collect();

        Ok(Self(tokens))
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a token in place.
    pub fn push(&mut self, token: impl Into<String>) {
        self.0.push(token.into());
    }

    /// Drop the last token in place.
    ///
    /// # Panics
    /// Panics if the pointer is empty; unbalanced `push`/`pop` pairs are a
    /// programmer error.
    pub fn pop(&mut self) {
        self.0.pop().expect("cannot pop empty pointer");
    }

    /// The pointer designating the parent of this one.
    ///
    /// # Panics
    /// Panics if the pointer is empty.
    pub fn parent(&self) -> Pointer {
        if self.0.is_empty() {
            panic!("empty pointer");
        }

        Self(self.0[..self.0.len() - 1].to_vec())
    }

    /// A new pointer extended by the given tokens.
    pub fn child<I, T>(&self, tokens: I) -> Pointer
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut p = self.clone();
        p.0.extend(tokens.into_iter().map(Into::into));
        p
    }

    /// Resolve the pointer against a JSON document.
    ///
    /// Each token is looked up as an object member; numeric tokens against an
    /// array are decimal indices. Returns `None` on a missing member, an
    /// out-of-range index, or a type mismatch.
    pub fn find<'a>(&self, value: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut v = value;

        for token in &self.0 {
            match v {
                serde_json::Value::Array(elements) => {
                    let i: usize = token.parse().ok()?;
                    v = elements.get(i)?;
                }

                serde_json::Value::Object(members) => {
                    v = members.get(token)?;
                }

                _ => return None,
            }
        }

        Some(v)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.0 {
            write!(f, "/{}", encode_token(token))?;
        }

        Ok(())
    }
}

impl FromStr for Pointer {
    type Err = PointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<T: Into<String>> FromIterator<T> for Pointer {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_tokens(iter)
    }
}

impl Serialize for Pointer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pointer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

fn encode_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn decode_token(s: &str) -> String {
    // ~1 must be decoded before ~0: "~01" means the literal token "~1".
    s.replace("~1", "/").replace("~0", "~")
}
