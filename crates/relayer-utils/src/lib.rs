// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Relayer Utils Module
//!
//! Common error types and small shared utilities for the Veil relayer
//! crates.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A module used for debugging relayer lifecycle, batching and submission
/// state.
pub mod probe;
/// Retry functionality
pub mod retry;

/// An enum of all possible errors that could be encountered during the
/// execution of the Veil relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error from Glob Iterator.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// Error in the underlying Http server.
    #[error(transparent)]
    Axum(#[from] axum::Error),
    /// HTTP Error
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
    /// A resource key is already reserved by another in-flight job.
    #[error("Resource already reserved: {}", key)]
    ResourceConflict {
        /// The contended resource key.
        key: String,
    },
    /// The job payload failed structural validation.
    #[error("Malformed job: {}", _0)]
    MalformedJob(String),
    /// The proof backend failed to produce a batch proof.
    #[error("Proof generation failed: {}", _0)]
    ProofGeneration(String),
    /// The chain rejected the submitted batch.
    #[error("Chain rejected submission: {}", _0)]
    ChainRejected(String),
    /// The chain submission did not complete within the configured timeout.
    ///
    /// The submission may still land on chain; the only safe recovery is to
    /// retry the whole batch, never to hand the batch resources to another
    /// job.
    #[error("Chain submission timed out, batch may still be pending")]
    SubmissionTimedOut,
    /// The insertion log already holds a different entry for this index.
    #[error("Conflicting insertion log entry at index {}", _0)]
    InconsistentInsertionLog(u64),
    /// Missing Secrets in the config, e.g. the relayer account key.
    #[error("Missing required account key in the config")]
    MissingSecrets,
    /// A chain name in the config did not match any configured chain.
    #[error("Chain Not Found: {}", chain_id)]
    ChainNotFound {
        /// The chain id of the chain.
        chain_id: String,
    },
    /// a background task failed and force restarted.
    #[error("Task Force Restarted from an error")]
    ForceRestart,
    /// Failed to send the response to the client.
    #[error("Failed to send response to the client")]
    FailedToSendResponse,
}

/// A type alias for the result for the Veil relayer, that uses the `Error`
/// enum.
pub type Result<T> = std::result::Result<T, Error>;

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Self::Sled(e),
        }
    }
}

impl From<Error> for HandlerError {
    fn from(value: Error) -> Self {
        let status = match value {
            Error::ResourceConflict { .. } => StatusCode::CONFLICT,
            Error::MalformedJob(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HandlerError(status, value.to_string())
    }
}

/// Error type for HTTP handlers
pub struct HandlerError(
    /// HTTP status code for response
    pub StatusCode,
    /// Response message
    pub String,
);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}
