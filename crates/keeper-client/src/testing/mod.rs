// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test support: an in-process ensemble and a fault-injecting connection
//!
//! These stand in for a real server when exercising [`crate::ChrootSession`]
//! in unit and integration tests.

pub mod faulty;
pub mod memory;

pub use faulty::{FailureBehavior, FaultPredicate, FaultyConnection};
pub use memory::{INITIAL_CONFIG, InMemoryConnection, InMemoryEnsemble};
