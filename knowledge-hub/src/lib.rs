//! HTTP front end for the knowledge-hub storage engine.

pub mod api;
