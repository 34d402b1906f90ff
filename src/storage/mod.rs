//! Object storage facade.
//!
//! The [`backend::StorageClient`] trait abstracts over where bytes
//! physically live.  Adapters cover AWS S3, Cloudflare R2 (through the S3
//! adapter), Google Cloud Storage, Alibaba Cloud OSS, and Vercel Blob.
//! [`factory::StorageFactory`] picks the adapter from a [`config::StorageConfig`]
//! and caches constructed clients by their target.

pub mod aws;
pub mod backend;
pub mod body;
pub mod config;
pub mod factory;
pub mod gcp;
pub mod keys;
pub mod oss;
pub mod signing;
pub mod vercel;

pub use backend::{PutObjectOptions, StorageClient, StorageObjectResult};
pub use config::{BlobAccess, StorageConfig, StorageProvider};
pub use factory::{create_client, StorageFactory};
