//! IDA ETL - loads ANATEL's service-quality spreadsheets into the
//! `ida_datamart` star schema.
//!
//! Stages, leaf first:
//! - [`fetcher`] downloads the spreadsheets (with a local byte cache)
//! - [`sheet`] locates the header and yields raw records
//! - [`normalizer`] maps each historical layout onto the canonical fact columns
//! - [`dimensions`] resolves time, service and economic-group surrogate keys
//! - [`loader`] writes one fact per (month, service, group)
//! - [`pipeline`] runs the stages per file and builds the run report

pub mod config;
pub mod dimensions;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod normalizer;
pub mod pipeline;
pub mod sheet;
pub mod warehouse;
