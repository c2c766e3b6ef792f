//! filemap - asynchronous page-mapped partial-file storage
//!
//! This library assembles a logical file on disk from out-of-order,
//! possibly overlapping byte ranges (a partially downloaded or proxied
//! object, for example) while letting callers read whatever ranges are
//! already durable and resume an interrupted transfer after a restart.
//!
//! # Modules
//!
//! - [`filemap`] - The storage engine: writes, reads, completeness, resume
//! - [`split`] - Page-boundary decomposition of byte ranges
//! - [`partial`] - In-memory buffering of sub-page fragments
//! - [`bitmap`] - Page-granular completeness tracking
//! - [`meta`] - On-disk metadata envelope
//! - [`aio`] - Asynchronous sub-operation dispatch and fan-out tracking
//! - [`registry`] - Named registry of live maps
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use filemap::{FileMap, FileMapConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let map = FileMap::create(FileMapConfig {
//!     data_path: "object.dat".into(),
//!     meta_path: "object.map".into(),
//!     aux_meta_path: None,
//!     page_size: 4096,
//!     truncate: true,
//! })
//! .await?;
//!
//! // Ranges may arrive in any order; sub-page fragments are buffered
//! // until their page fills up.
//! map.write(8192, Bytes::from(vec![0u8; 4096]), Box::new(|_| {}), 1)?;
//! map.write(0, Bytes::from(vec![0u8; 4096]), Box::new(|_| {}), 1)?;
//!
//! assert!(map.has_bytes(0, 4095) || map.in_flight() > 0);
//! # Ok(())
//! # }
//! ```

pub mod aio;
pub mod bitmap;
pub mod error;
pub mod filemap;
pub mod meta;
pub mod partial;
pub mod registry;
pub mod split;

pub use aio::{Finish, FinishFn, NotifyFn, RequestId};
pub use bitmap::PageBitmap;
pub use error::{FileMapError, MetaError};
pub use filemap::{FileMap, FileMapConfig, Submit};
pub use meta::MainRecord;
pub use partial::{Merge, PartialPage, PartialStore};
pub use registry::FileMapRegistry;
pub use split::{split, Split};
