//! Capability-set boundary between the media-plane core and the host OS
//! (spec.md §6, §9: "desktop backend" and "encoder backend" as small traits
//! rather than deep class hierarchies).

pub mod desktop;
pub mod encoder;

pub use desktop::DesktopService;
pub use encoder::{EncoderBackend, Pipeline};
