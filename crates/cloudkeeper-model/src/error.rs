// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Errors raised when a runtime model is inconsistent.

use thiserror::Error;

/// Errors from model validation and declaration lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A connection endpoint refers to a port or child that does not exist.
    #[error("Connection endpoint {endpoint} is out of range")]
    EndpointOutOfRange {
        /// Display form of the offending endpoint.
        endpoint: String,
    },

    /// The endpoints of a connection do not form one of the four connection kinds.
    #[error("Invalid connection from {from} to {to}")]
    InvalidConnection {
        /// Display form of the source endpoint.
        from: String,
        /// Display form of the target endpoint.
        to: String,
    },

    /// A port receives values from more than one connection.
    #[error("Endpoint {endpoint} has more than one incoming connection")]
    DuplicateTarget {
        /// Display form of the target endpoint.
        endpoint: String,
    },

    /// An out-port or child in-port has no incoming connection.
    #[error("Endpoint {endpoint} has no incoming connection")]
    Unconnected {
        /// Display form of the unfed endpoint.
        endpoint: String,
    },

    /// Sibling connections between children form a cycle.
    #[error("Children {children:?} depend on each other through sibling connections")]
    Cycle {
        /// Names of the children on or behind the cycle.
        children: Vec<String>,
    },

    /// A proxy references a declaration missing from the repository.
    #[error("Unknown declaration '{0}'")]
    UnknownDeclaration(String),

    /// A proxy's ports do not match the ports of its declaration.
    #[error("Module '{module}' does not match the ports of declaration '{declaration}'")]
    PortMismatch {
        /// Name of the proxy module.
        module: String,
        /// Name of the declaration.
        declaration: String,
    },

    /// A module kind requires a port layout it does not have.
    #[error("Module '{module}' is malformed: {reason}")]
    Malformed {
        /// Name of the module.
        module: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An execution trace string could not be parsed.
    #[error("Invalid execution trace '{0}'")]
    InvalidTrace(String),
}
