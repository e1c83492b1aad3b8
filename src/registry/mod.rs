//! Registry access layer
//!
//! # Modules
//!
//! - [`client`]: `RegistryClient` trait consumed by the engine
//! - [`oci`]: OCI distribution API client with bearer-token cache
//! - [`catalog`]: Docker Hub popular-image catalog
//! - [`reference`]: `endpoint/image:tag` parsing
//! - [`tags`]: signature/attestation tag filtering
//! - [`error`]: registry error type

pub mod catalog;
pub mod client;
pub mod error;
pub mod oci;
pub mod reference;
pub mod tags;
