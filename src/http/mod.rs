//! HTTP surface for the Model Context Protocol
//!
//! Provides the `/mcp` endpoint handlers: the streamable POST exchange and the
//! fixed rejection for other verbs.

pub mod handlers;
