//! objsync-s3: S3 adapter for objsync
//!
//! Implements the `ObjectStore` trait from objsync-core on top of aws-sdk-s3.

pub mod client;

pub use client::S3Client;
