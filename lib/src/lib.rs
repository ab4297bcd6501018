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

//! A portable implementation of the Jujutsu version-control model: a
//! change-centric engine over a content-addressed object store,
//! interoperable with Git.

#![deny(unused_must_use)]

pub mod backend;
pub mod conflicts;
pub mod dag_walk;
pub mod error;
pub mod events;
pub mod file_util;
pub mod fs;
pub mod git;
pub mod graph;
pub mod lock;
pub mod merge;
pub mod object_id;
pub mod op_store;
pub mod operation;
pub mod refs;
pub mod repo;
pub mod revset;
pub mod revset_parser;
pub mod rewrite;
pub mod settings;
pub mod storage;
pub mod str_util;
pub mod transaction;
pub mod working_copy;
