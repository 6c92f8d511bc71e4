// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;

use serde::{
  de::{MapAccess, Visitor},
  ser::SerializeMap,
  Deserialize, Deserializer, Serialize, Serializer,
};

/// Ordered multimap of HTTP header names to values
///
/// On the wire this is a JSON object whose values are either a single string
/// or an array of strings for repeated headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn append<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
    self.0.push((name.into(), value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  /// All values for `name`, compared case-insensitively, in insertion order
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .0
      .iter()
      .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
    self.get_all(name).next()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Groups values by name, keeping the spelling and position of each name's first occurrence
  fn grouped(&self) -> Vec<(&str, Vec<&str>)> {
    let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
    for (name, value) in self.iter() {
      match groups
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
      {
        Some((_, values)) => values.push(value),
        None => groups.push((name, vec![value])),
      }
    }
    groups
  }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(n, v)| (n.into(), v.into()))
        .collect(),
    )
  }
}

impl From<&reqwest::header::HeaderMap> for Headers {
  fn from(map: &reqwest::header::HeaderMap) -> Self {
    map
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_owned(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect()
  }
}

impl Serialize for Headers {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let groups = self.grouped();
    let mut map = serializer.serialize_map(Some(groups.len()))?;
    for (name, values) in groups {
      match values.as_slice() {
        [single] => map.serialize_entry(name, single)?,
        many => map.serialize_entry(name, many)?,
      }
    }
    map.end()
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
  One(String),
  Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
  type Value = Headers;

  fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("a map of header names to a string or an array of strings")
  }

  fn visit_unit<E>(self) -> Result<Self::Value, E>
  where
    E: serde::de::Error,
  {
    Ok(Headers::new())
  }

  fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
  where
    A: MapAccess<'de>,
  {
    let mut headers = Headers::new();
    while let Some((name, value)) = access.next_entry::<String, WireValue>()? {
      match value {
        WireValue::One(value) => headers.append(name, value),
        WireValue::Many(values) => {
          for value in values {
            headers.append(name.clone(), value);
          }
        }
      }
    }
    Ok(headers)
  }
}

impl<'de> Deserialize<'de> for Headers {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    deserializer.deserialize_any(HeadersVisitor)
  }
}
