//! `ocidist`: reference resolution, registry auth, blob/manifest
//! transfer, artifact packaging, OCI Image Layout, and the copy engine
//! that ties them together.

pub mod auth;
pub mod client;
pub mod compression;
pub mod content_store;
pub mod copy;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod model;
pub mod oci_layout;
pub mod packager;
pub mod reference;
pub mod registries_conf;
pub mod scope;
pub mod transport;

pub use client::Registry;
pub use content_store::{ContentStore, Referrers, Selector};
pub use digest::Digest;
pub use error::{Error, Result};
pub use oci_layout::OciLayout;
pub use reference::ContainerRef;
