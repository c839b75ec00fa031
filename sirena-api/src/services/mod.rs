//! Service layer: authentication machinery, caching, and background tasks

pub mod clamd;
pub mod cookies;
pub mod entites;
pub mod janitor;
pub mod oidc;
pub mod session;

pub use clamd::{ClamdClient, ScanVerdict};
pub use entites::{EntiteCache, EntiteTree};
pub use janitor::{JanitorConfig, UploadJanitor};
pub use oidc::OidcClient;
