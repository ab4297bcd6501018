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

//! Machine-readable error classification shared by every engine module.

use std::fmt;

/// The coarse category of an engine failure. Every module-level error maps
/// to exactly one kind, so callers can dispatch on the category without
/// matching on each module's error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Conflict,
    StorageError,
    ParseError,
    UnsupportedOperation,
    ValidationError,
    PreHookRejected,
}

impl ErrorKind {
    /// The stable wire code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::PreHookRejected => "PRE_HOOK_REJECTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by module errors so the facade can report a classified
/// failure with optional context (an offending id or path) and a
/// human-readable suggestion.
pub trait ClassifiedError: std::error::Error {
    fn kind(&self) -> ErrorKind;

    /// The entity the failure is about, if any (a change id, a path, a
    /// bookmark name).
    fn context(&self) -> Option<String> {
        None
    }

    /// What the user might do about it.
    fn suggestion(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorKind::InvalidArgument.code(), "INVALID_ARGUMENT");
        assert_eq!(ErrorKind::StorageError.code(), "STORAGE_ERROR");
        assert_eq!(ErrorKind::PreHookRejected.code(), "PRE_HOOK_REJECTED");
        assert_eq!(ErrorKind::Conflict.to_string(), "CONFLICT");
    }
}
