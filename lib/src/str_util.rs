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
pub enum StringPatternParseError {
    #[error("Invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),
}

/// Pattern argument of revset functions like `author()` and `file()`.
/// Bare text matches as a case-insensitive substring; `re:` switches to a
/// regex, `glob:` to a path glob (`**` crosses directories).
#[derive(Clone, Debug)]
pub enum StringPattern {
    Substring(String),
    Regex(regex::Regex),
    Glob(glob::Pattern),
}

impl StringPattern {
    pub fn parse(text: &str) -> Result<StringPattern, StringPatternParseError> {
        if let Some(pattern) = text.strip_prefix("re:") {
            Ok(StringPattern::Regex(regex::Regex::new(pattern)?))
        } else if let Some(pattern) = text.strip_prefix("glob:") {
            Ok(StringPattern::Glob(glob::Pattern::new(pattern)?))
        } else {
            Ok(StringPattern::Substring(text.to_owned()))
        }
    }

    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            StringPattern::Substring(needle) => haystack
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            StringPattern::Regex(regex) => regex.is_match(haystack),
            StringPattern::Glob(pattern) => {
                let options = glob::MatchOptions {
                    require_literal_separator: true,
                    ..Default::default()
                };
                pattern.matches_with(haystack, options)
            }
        }
    }
}
