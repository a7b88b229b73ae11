//! Museum Attendance Enrichment Library
//!
//! Extracts the most visited museums table from a Wikipedia page, cleans
//! the rows and enriches each record with the population of its city.
//!
//! # Modules
//!
//! - `cleaning`: Row validation, visitor count and year parsing.
//! - `config`: Configuration management.
//! - `enrichment`: Deduplicated, bounded, retrying population lookups.
//! - `errors`: Error handling types.
//! - `extraction`: Table selection and row extraction from page markup.
//! - `integrations`: Wikipedia and GeoNames clients.
//! - `location`: City field to lookup key resolution.
//! - `models`: Core data models.
//! - `pipeline`: End-to-end run and summary.

pub mod cleaning;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod extraction;
pub mod integrations;
pub mod location;
pub mod models;
pub mod pipeline;
