use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared::domain::SortOrder;
use shared::protocol::{CursorPair, PageResponse};

use crate::error::{ClientError, PageDirection};
use crate::http::{ApiClient, ApiVersion};

/// Query configuration for one paginated fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub order: SortOrder,
    pub page_size: u32,
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            order: SortOrder::Asc,
            page_size: 10,
            cursor: None,
        }
    }
}

impl PageRequest {
    /// Same order and page size, positioned at the given cursor.
    pub fn with_cursor(&self, cursor: impl Into<String>) -> Self {
        Self {
            order: self.order,
            page_size: self.page_size,
            cursor: Some(cursor.into()),
        }
    }
}

/// Issues the fetch behind a page; resource-specific fetchers also merge
/// fetched items into local state before handing the page back.
#[async_trait]
pub trait PageFetcher<T>: Send + Sync {
    async fn fetch_page(self: Arc<Self>, request: PageRequest) -> Result<Page<T>, ClientError>;
}

/// Immutable snapshot of one page of `T` plus the cursors and query
/// configuration that produced it. Advancing never mutates the page it was
/// called on.
pub struct Page<T> {
    items: Vec<T>,
    cursor: CursorPair,
    request: PageRequest,
    fetcher: Arc<dyn PageFetcher<T>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Page<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("items", &self.items)
            .field("cursor", &self.cursor)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

fn cursor_value(cursor: &Option<String>) -> Option<&str> {
    cursor.as_deref().filter(|cursor| !cursor.is_empty())
}

impl<T> Page<T> {
    pub fn new(
        items: Vec<T>,
        cursor: CursorPair,
        request: PageRequest,
        fetcher: Arc<dyn PageFetcher<T>>,
    ) -> Self {
        Self {
            items,
            cursor,
            request,
            fetcher,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn has_prev(&self) -> bool {
        cursor_value(&self.cursor.prev).is_some()
    }

    pub fn has_next(&self) -> bool {
        cursor_value(&self.cursor.next).is_some()
    }

    /// Fetch the adjacent previous page; absent cursor is a deterministic
    /// error, no network call.
    pub async fn get_prev(&self) -> Result<Page<T>, ClientError> {
        match cursor_value(&self.cursor.prev) {
            Some(cursor) => {
                let request = self.request.with_cursor(cursor);
                Arc::clone(&self.fetcher).fetch_page(request).await
            }
            None => Err(ClientError::NoSuchPage(PageDirection::Prev)),
        }
    }

    /// Fetch the adjacent next page; absent cursor is a deterministic
    /// error, no network call.
    pub async fn get_next(&self) -> Result<Page<T>, ClientError> {
        match cursor_value(&self.cursor.next) {
            Some(cursor) => {
                let request = self.request.with_cursor(cursor);
                Arc::clone(&self.fetcher).fetch_page(request).await
            }
            None => Err(ClientError::NoSuchPage(PageDirection::Next)),
        }
    }
}

/// Plain paginated resource with no local merge step.
pub struct HttpPageFetcher<T> {
    api: Arc<ApiClient>,
    path: String,
    version: ApiVersion,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HttpPageFetcher<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(api: Arc<ApiClient>, path: impl Into<String>, version: ApiVersion) -> Arc<Self> {
        Arc::new(Self {
            api,
            path: path.into(),
            version,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<T> PageFetcher<T> for HttpPageFetcher<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch_page(self: Arc<Self>, request: PageRequest) -> Result<Page<T>, ClientError> {
        let response: PageResponse<T> = self
            .api
            .fetch_page(&self.path, self.version, &request)
            .await?;
        Ok(Page::new(response.items, response.cursor, request, self))
    }
}
