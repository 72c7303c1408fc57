//! Client for the remote media library.
//!
//! Provides the snapshot models (movies, shows, seasons, episodes and their
//! assets), the [`LibraryClient`] trait the filesystem consumes, and an HTTP
//! implementation of it.

pub mod client;
pub mod error;
pub mod models;

pub use client::{DEFAULT_TOKEN_HEADER, HttpLibraryClient, LibraryClient, auth_headers};
pub use error::{LibraryError, LibraryResult};
pub use models::{Asset, AssetKind, Episode, Movie, Season, Show};
