// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types
//!
//! The fallible surface is the world-level API. The emit pipeline itself
//! has no recoverable-error channel: preconditions and invariants abort,
//! benign absence is represented as `None`/skip.

use std::fmt;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Entity not found or no longer alive
    EntityNotFound,

    /// Component not found
    ComponentNotFound,

    /// Invalid entity ID
    InvalidEntity,

    /// Relationship edge would form a cycle
    CycleDetected(String),

    /// Invalid parameter for a world operation
    InvalidParameter(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ComponentNotFound => write!(f, "Component not found"),
            EcsError::InvalidEntity => write!(f, "Invalid entity ID"),
            EcsError::CycleDetected(msg) => write!(f, "Relationship cycle detected: {msg}"),
            EcsError::InvalidParameter(msg) => write!(f, "Invalid parameter: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
