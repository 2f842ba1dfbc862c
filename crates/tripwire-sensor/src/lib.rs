//! Tripwire sensor: classifies HTTP requests and records attacks.
//!
//! # Modules
//!
//! - [`detect`] - Rule engine ([`Classifier`]) and the burst window
//! - [`client_ip`] - Client address resolution and normalization
//! - [`geo`] - Best-effort geolocation
//! - [`writer`] - Durable JSON-lines event log ([`EventWriter`])
//! - [`middleware`] - axum middleware wiring the above into an app
//!
//! ```text
//! request ──► Classifier ──► (match) ──► EventWriter ──► attacks.jsonl
//!    │
//!    └──────► handler (always runs)
//! ```

pub mod client_ip;
pub mod detect;
pub mod error;
pub mod geo;
pub mod middleware;
pub mod writer;

pub use client_ip::ClientIp;
pub use detect::{Classifier, Detection, DetectionConfig, RequestDescriptor, UploadedFile};
pub use error::{Error, Result};
pub use geo::{GeoResolver, GeoTable, NoGeo};
pub use middleware::{Sensor, SensorConfig};
pub use writer::{EventWriter, WriterConfig};
