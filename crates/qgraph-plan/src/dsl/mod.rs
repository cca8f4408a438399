//! Front-ends that build plans from text.

pub mod yaml;
