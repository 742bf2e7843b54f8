//! Virtual path resolution for StagFS.
//!
//! The first segment of a virtual path selects a view; the view resolves the
//! rest.
//!
//! ```text
//! /movie/genre/Horror/Alien
//!  └────┘└────────────────┘
//!  datatype   residual → TagView → Resolved::File("/media/Alien")
//! ```
//!
//! - [`ViewDispatcher`]: Routes paths, lists the virtual root
//! - [`TagView`]: Default resolver walking one datatype's tag forest
//! - [`View`]: Trait for custom presentations

pub mod dispatcher;
pub mod view;

pub use dispatcher::ViewDispatcher;
pub use view::{TagView, View, split_path};
