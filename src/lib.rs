//! Terminal dashboard and simulator for an ADR cryostat.

pub mod app;
pub mod chart;
pub mod config;
pub mod feed;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod sim;
pub mod store;
pub mod ui;
pub mod views;
