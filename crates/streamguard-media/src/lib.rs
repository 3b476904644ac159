//! Streamguard-Media: incremental indexing of fragmented media containers.
//!
//! Fragmented video is delivered as a sequence of independent range
//! requests. The first request (file offset zero) carries the container
//! metadata; later requests carry self-contained payload units. This crate
//! turns the first chunk into an index and later chunks into fragments that
//! can be matched back to the rendition they belong to.
//!
//! # Modules
//!
//! - `mp4` - ISO-BMFF box readers, `sidx` parsing, track header inspection
//! - `fmp4` - Fragmented MP4 init segment and `moof`/`mdat` extraction
//! - `ebml` - EBML varints/elements, WebM Cues index and Cluster extraction
//! - `fragment` - Container-independent [`ContainerIndex`] and [`Fragment`]
//! - `inspect` - Layout dumps for diagnostics
//!
//! All parsing is synchronous and bounds-checked; malformed input yields an
//! [`Error`] or an empty fragment list, never a panic.

pub mod ebml;
pub mod error;
pub mod fmp4;
pub mod fragment;
pub mod inspect;
pub mod mp4;

pub use error::{Error, Result};
pub use fragment::{ContainerFamily, ContainerIndex, Fragment, FragmentSignature};
