//! Scan pipeline turning a photographed paper receipt into a structured,
//! validated purchase record: recognized text fragments are reassembled into
//! a reading-ordered transcript, handed to a completion service under a fixed
//! extraction schema, and the decoded payload is validated into domain
//! entities.

pub mod assemble;
pub mod config;
pub mod error;
pub mod geometry;
pub mod llm_extract;
pub mod model;
pub mod scan;
pub mod store;
pub mod transcript;
