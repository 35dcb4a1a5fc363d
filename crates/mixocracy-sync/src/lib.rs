// Library root: re-exports all modules so integration tests and external
// consumers can access the crate's public API.

pub mod app;
pub mod config;
pub mod db;
pub mod ledger;
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod reconciler;
pub mod removal;
pub mod ws_server;
