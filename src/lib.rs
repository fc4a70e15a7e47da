//! HTTP surface of the mesh generation server.

pub mod web;
