//! Trustseed - cluster transport trust bootstrap
//!
//! Gets one shared TLS trust bundle onto every node of a search-engine
//! cluster without an operator copying files around.
//!
//! Roles:
//! - Authority: generates the bundle, serves it over HTTP for a bounded
//!   session, then installs it locally
//! - Follower: polls the Authority with bounded retries, then installs what
//!   it retrieved
//!
//! Invariants:
//! - A Follower never installs a partial or empty bundle
//! - Installed bundles are mode 0640 and owned by the service account
//! - Every node ends up with byte-identical bundles (same fingerprint)
//!
//! The distribution channel is plain, unauthenticated HTTP. Only bootstrap
//! on a trusted network segment and compare fingerprints afterwards.

pub mod bootstrap;
pub mod bundle;
pub mod config;
pub mod distribution;
pub mod identity;
pub mod install;
pub mod logging;
pub mod retry;
