//! Application layer: persistence contracts and error taxonomy.

pub mod error;
pub mod repos;
