//! Common types for Frisbee: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod labels;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by every Frisbee custom resource
pub const FRISBEE_GROUP: &str = "frisbee.dev";

/// API version shared by every Frisbee custom resource
pub const FRISBEE_API_VERSION: &str = "frisbee.dev/v1alpha1";

/// Field manager used for every server-side patch issued by the controllers
pub const FIELD_MANAGER: &str = "frisbee-controller";

/// Default port of the alert webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 6666;
