//! Bundle distribution between nodes.
//!
//! The wire protocol is a plain HTTP GET of `/<bundle file name>`:
//! - server: Authority side, one bounded session
//! - client: Follower side, bounded retries

pub mod client;
pub mod server;

pub use client::{
    AttemptOutcome, FetchFailure, Fetcher, HttpFetcher, RetrievalAttempt, RetrievalCampaign,
    RetrievalError, Retrieved, RetrievingClient,
};
pub use server::{
    DistributionServer, DistributionSession, ServeError, SessionOptions, SessionState, StopReason,
};
