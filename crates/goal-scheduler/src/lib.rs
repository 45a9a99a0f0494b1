/*
 * 5D Labs Agent Platform - Kubernetes Goal Scheduler
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

//! Goal scheduler library
//!
//! Runs delivery goals as isolated Kubernetes Jobs: the orchestrator fulfils
//! a container registration, synthesizes a Job from its own pod and creates
//! it; inside the Job an init container prepares the project and secrets
//! while a monitor container follows the goal container and reports back.

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod execution;
pub mod goal;
pub mod k8s;
pub mod mode;
pub mod secrets;

pub use error::{Error, Result};
