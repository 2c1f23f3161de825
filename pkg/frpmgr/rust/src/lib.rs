// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]

pub mod cli;
pub mod commands;
pub mod context;
pub mod error;
pub mod lock;
pub mod procfs;
pub mod query;
pub mod record;
pub mod render;
pub mod settings;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod tunnel;
pub mod validate;
pub mod version;

pub use error::{Error, ErrorKind, Result};
