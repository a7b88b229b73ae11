//! External service integrations.

pub mod geonames;
pub mod wikipedia;
