// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for EngCheck tools (config, monitor settings).
//! Keeps the CLI and any other front end thin and storage-agnostic.

pub mod config;
pub mod settings;
