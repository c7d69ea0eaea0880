//! Splice Timeline Model
//!
//! Defines the editing data that exports consume:
//! - **Elements:** Timed items with a closed, kind-specific payload
//! - **Tracks:** Typed lanes; track order is z-order
//! - **Timeline:** Validated mutations, time queries, and JSON documents
//! - **Snapshots:** Immutable copies taken at export start
//! - **Settings:** Output dimensions, frame rate, quality, and container
//!
//! Positions on the canvas are pixels relative to the canvas center.

pub mod element;
pub mod settings;
pub mod timeline;
pub mod track;

pub use element::*;
pub use settings::*;
pub use timeline::*;
pub use track::*;
