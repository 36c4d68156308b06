//! Host design surface.
//!
//! The host editor owns pages and element placement. This crate only talks to
//! it through [`DesignSurface`]; [`PageSink`] binds one page to the stream's
//! [`DeliverySink`] seam.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::delivery::{DeliveryError, DeliverySink};
use crate::stream::proto::{ElementDescriptor, PageDimensionsMsg};

/// Opaque host page handle.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("host rejected element: {0}")]
    Rejected(String),

    #[error("host unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DesignSurface: Send + Sync {
    /// Dimensions of the page new content is laid out against.
    async fn page_dimensions(&self) -> Result<PageDimensionsMsg, SurfaceError>;

    /// Places one element on an existing page, above everything placed before.
    async fn add_element(
        &self,
        page: &PageId,
        element: &ElementDescriptor,
    ) -> Result<(), SurfaceError>;

    /// Creates a page holding `elements` in order.
    async fn create_page(
        &self,
        title: &str,
        elements: &[ElementDescriptor],
    ) -> Result<PageId, SurfaceError>;
}

/// Delivers elements onto one page of a [`DesignSurface`].
#[derive(Clone)]
pub struct PageSink {
    surface: Arc<dyn DesignSurface>,
    page: PageId,
}

impl PageSink {
    pub fn new(surface: Arc<dyn DesignSurface>, page: PageId) -> Self {
        Self { surface, page }
    }

    pub fn page(&self) -> &PageId {
        &self.page
    }
}

impl fmt::Debug for PageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSink")
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeliverySink for PageSink {
    async fn deliver(&self, element: &ElementDescriptor) -> Result<(), DeliveryError> {
        self.surface
            .add_element(&self.page, element)
            .await
            .map_err(|err| DeliveryError::new(err.to_string()))
    }
}

/// A page held by [`InMemorySurface`].
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryPage {
    pub id: PageId,
    pub title: String,
    pub elements: Vec<ElementDescriptor>,
}

/// [`DesignSurface`] kept in process memory.
///
/// Useful for dry runs and for exercising a batch without a host editor.
#[derive(Debug)]
pub struct InMemorySurface {
    dimensions: PageDimensionsMsg,
    pages: Mutex<Vec<MemoryPage>>,
}

impl InMemorySurface {
    pub fn new(dimensions: PageDimensionsMsg) -> Self {
        Self {
            dimensions,
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Adds an empty page up front, e.g. to be reused as a card slot.
    pub fn with_page(self, title: impl Into<String>) -> Self {
        if let Ok(mut pages) = self.pages.lock() {
            let id = PageId::new(format!("page-{}", pages.len() + 1));
            pages.push(MemoryPage {
                id,
                title: title.into(),
                elements: Vec::new(),
            });
        }
        self
    }

    pub fn pages(&self) -> Vec<MemoryPage> {
        self.pages
            .lock()
            .map(|pages| pages.clone())
            .unwrap_or_default()
    }

    pub fn page(&self, id: &PageId) -> Option<MemoryPage> {
        self.pages().into_iter().find(|page| &page.id == id)
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages().into_iter().map(|page| page.id).collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<MemoryPage>>, SurfaceError> {
        self.pages
            .lock()
            .map_err(|_| SurfaceError::Unavailable("page store poisoned".to_string()))
    }
}

#[async_trait]
impl DesignSurface for InMemorySurface {
    async fn page_dimensions(&self) -> Result<PageDimensionsMsg, SurfaceError> {
        Ok(self.dimensions)
    }

    async fn add_element(
        &self,
        page: &PageId,
        element: &ElementDescriptor,
    ) -> Result<(), SurfaceError> {
        let mut pages = self.lock()?;
        let target = pages
            .iter_mut()
            .find(|candidate| &candidate.id == page)
            .ok_or_else(|| SurfaceError::PageNotFound(page.clone()))?;
        target.elements.push(element.clone());
        Ok(())
    }

    async fn create_page(
        &self,
        title: &str,
        elements: &[ElementDescriptor],
    ) -> Result<PageId, SurfaceError> {
        let mut pages = self.lock()?;
        let id = PageId::new(format!("page-{}", pages.len() + 1));
        pages.push(MemoryPage {
            id: id.clone(),
            title: title.to_string(),
            elements: elements.to_vec(),
        });
        Ok(id)
    }
}
