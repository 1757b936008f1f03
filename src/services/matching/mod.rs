//! Order Matching Engine Module
//!
//! Price-time priority matching for binary markets, organised as:
//!
//! ```text
//! ExchangeService
//!   -> MarketRegistry (one handle per live market)
//!        -> MarketWorker (single writer, bounded command channel)
//!             |- Book (YES-space price levels)
//!             |- escrow (admission + fill settlement)
//!             `- ledger transaction per command
//! ```
//!
//! Orders on either outcome meet in one YES-space book per market: the
//! price map converts NO intents at admission and back again at the edges.
//! Every command commits its ledger transaction before the in-memory book
//! or any subscriber sees the change.

pub mod book;
pub mod engine;
pub mod escrow;
pub mod registry;
pub mod types;

pub use engine::EngineConfig;
pub use registry::{MarketHandle, MarketRegistry};
pub use types::{
    BookSnapshot, CancellationResult, MatchingError, ResolutionResult, SubmissionResult,
};
