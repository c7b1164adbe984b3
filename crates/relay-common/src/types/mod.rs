//! Core data types for the Relay pipeline

pub mod record;
