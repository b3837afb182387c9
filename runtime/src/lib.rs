// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tagwatch runtime library. Checks that a fleet of websites still fires
//! its expected analytics tags, escalating slow pages and retrying
//! persistent failures.
//!
//! This library crate exposes the core modules for the binary and for
//! integration testing.

#![allow(clippy::new_without_default)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod recovery;
pub mod renderer;
pub mod rest;
pub mod retry;
pub mod runner;
pub mod screenshots;
pub mod store;
pub mod targets;
pub mod validate;
