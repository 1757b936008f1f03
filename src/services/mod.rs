pub mod auth;
pub mod exchange;
pub mod ledger;
pub mod matching;
pub mod settlement;
