// Copyright 2024 The PJJ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(missing_docs)]

use thiserror::Error;

#[derive(Debug, Error)]
#[error("Invalid hex id \"{input}\"")]
pub struct HexDecodeError {
    pub input: String,
}

pub trait ObjectId {
    fn new(value: Vec<u8>) -> Self;
    fn object_type(&self) -> String;
    fn from_bytes(bytes: &[u8]) -> Self;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn try_from_hex(hex: &str) -> Result<Self, HexDecodeError>
    where
        Self: Sized;
    fn hex(&self) -> String;
}

macro_rules! id_type {
    ($vis:vis $name:ident) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);
        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                use $crate::object_id::ObjectId as _;
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn try_from_hex(hex: &str) -> Result<Self, $crate::object_id::HexDecodeError> {
                hex::decode(hex).map(Self).map_err(|_| {
                    $crate::object_id::HexDecodeError {
                        input: hex.to_owned(),
                    }
                })
            }

            fn hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        // Ids are stored in the JSON metadata files as lowercase hex.
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                use $crate::object_id::ObjectId as _;
                serializer.serialize_str(&self.hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                use $crate::object_id::ObjectId as _;
                let hex = String::deserialize(deserializer)?;
                Self::try_from_hex(&hex).map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use {id_type, impl_id_type};

/// A hex string that may be a prefix of an object id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexPrefix {
    hex: String,
}

impl HexPrefix {
    pub fn new(prefix: &str) -> Option<HexPrefix> {
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(HexPrefix {
            hex: prefix.to_ascii_lowercase(),
        })
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn matches<T: ObjectId>(&self, id: &T) -> bool {
        id.hex().starts_with(&self.hex)
    }
}

/// The result of resolving an id prefix against a set of candidates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrefixResolution<T> {
    NoMatch,
    SingleMatch(T),
    AmbiguousMatch,
}

pub fn resolve_prefix<T, I>(prefix: &HexPrefix, candidates: I) -> PrefixResolution<T>
where
    T: ObjectId + PartialEq,
    I: IntoIterator<Item = T>,
{
    let mut resolution = PrefixResolution::NoMatch;
    for candidate in candidates {
        if !prefix.matches(&candidate) {
            continue;
        }
        match &resolution {
            PrefixResolution::NoMatch => {
                resolution = PrefixResolution::SingleMatch(candidate);
            }
            PrefixResolution::SingleMatch(existing) if *existing == candidate => {}
            _ => return PrefixResolution::AmbiguousMatch,
        }
    }
    resolution
}
