//! HTTP front end that runs every incoming request through the pipeline.

mod server;

pub use server::HttpServer;
