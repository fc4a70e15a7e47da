// Web server modules for the mesh generation service

pub mod generation_queue;
pub mod logger;
pub mod path;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod security;
pub mod server;
pub mod tls;
