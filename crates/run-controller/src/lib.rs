/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Run execution engine
//!
//! Runs move through a guarded lifecycle graph. A runtime resolves each run
//! into a runnable, a framework turns the runnable into Kubernetes objects,
//! and monitors reconcile those objects back into runnable and run state.

pub mod cluster;
pub mod config;
pub mod error;
pub mod frameworks;
pub mod fsm;
pub mod lifecycle;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod runtime;
pub mod store;

pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use lifecycle::RunState;
