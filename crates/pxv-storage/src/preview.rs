//! Preview (thumbnail) interface. Rendering itself is external.

use std::path::Path;

use pxv_core::{MaterializationState, MediaType};

/// Cleartext handed to a renderer.
pub enum PreviewSource<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

/// Produces small preview images from cleartext media.
pub trait PreviewRenderer: Send + Sync {
    /// `None` when no preview can or should be made for this item.
    fn render(&self, media_type: MediaType, source: PreviewSource<'_>) -> Option<Vec<u8>>;
}

/// Renderer for deployments without thumbnail support.
pub struct NoPreview;

impl PreviewRenderer for NoPreview {
    fn render(&self, _media_type: MediaType, _source: PreviewSource<'_>) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub media_type: MediaType,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewModel {
    Ready(Preview),
    /// Item bytes are not local yet; carries the current state for display
    Pending(MaterializationState),
    /// Item is resident but no preview was ever rendered for it
    Unavailable,
}
