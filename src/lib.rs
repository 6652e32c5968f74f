//! pixelmill: asynchronous image-processing platform.
//!
//! Uploads are accepted over HTTP, durably enqueued on a Redis stream,
//! dispatched to a fleet of workers that run the transformation pipeline,
//! and reclaimed by a retention sweeper once their window elapses. Postgres
//! is the arbiter of job lifecycle state; an S3-compatible store holds the
//! original and processed blobs.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
