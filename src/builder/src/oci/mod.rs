//! OCI image production.
//!
//! Everything needed to turn a function project into a standards
//! compliant OCI Image Layout on the local filesystem:
//!
//! ```text
//! .func/builds/by-hash/<fingerprint>/
//! ├── oci/
//! │   ├── oci-layout          layout version marker
//! │   ├── index.json          multi-platform image index
//! │   └── blobs/sha256/       layers, configs, manifests
//! ├── result/                 intermediate compile outputs
//! └── service/                scaffolded wrapper source
//! ```
//!
//! The [`builder::Builder`] coordinates a build; [`tarball`] produces the
//! layer archives; [`base`] fetches and caches base images; [`blob`]
//! handles content-addressed placement; [`languages`] holds the
//! per-runtime strategies.

pub mod base;
pub mod blob;
pub mod builder;
pub mod credentials;
pub mod job;
pub mod languages;
pub mod tarball;
pub mod types;

pub use base::BaseImage;
pub use builder::Builder;
pub use job::BuildJob;
pub use languages::{is_supported, LanguageBuilder};
pub use tarball::Layer;
pub use types::{ConfigFile, Descriptor, Hash, Index, Manifest};
