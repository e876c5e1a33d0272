//! Automatic tag suggestions for e621 uploads from a locally hosted tagging model.

pub mod autocomplete;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetcher;
pub mod session;
pub mod tags;
pub mod utils;

pub use autocomplete::{AutocompleteClient, FieldStyle, TagSuggestion};
pub use client::{Prediction, RequestEvent, RequestObserver, TaggerClient};
pub use config::{Config, ConfigPatch, ConfigStore, SortingMode};
pub use connection::{ConnectionStatus, ConnectionTracker};
pub use error::{Error, Result};
pub use fetcher::ImageFetcher;
pub use session::Session;
pub use tags::PageKind;
