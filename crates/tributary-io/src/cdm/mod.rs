//! Common Data Model change feed source
//!
//! Layout under the configured root:
//!
//! ```text
//! {root}/model.json                     manifest with entity attributes
//! {root}/{entity}/*.csv                 base snapshot files
//! {root}/ChangeFeed/{entity}/*.csv      append-only change files
//! ```
//!
//! CSV files carry no header; columns follow the manifest attribute order.

pub mod manifest;
mod source;

pub use manifest::{CdmManifest, MANIFEST_FILE};
pub use source::{CdmChangeFeedSource, CHANGE_FEED_FOLDER};
