//! Generic loader contract and its context-backed implementation.

use crate::logging::log_entry;
use crate::model::entity::ManagedEntity;
use crate::model::object_id::ObjectId;
use crate::model::predicate::Predicate;
use crate::store::{Context, FetchRequest, SortDescriptor, StoreError};
use async_trait::async_trait;
use log::Level;
use std::fmt::Display;
use std::marker::PhantomData;
use thiserror::Error;

pub type LoaderResult<T> = Result<T, LoaderError>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("loader operation failed: {0}")]
    OperationFailed(#[from] StoreError),
    #[error("no record matches the query")]
    NotFound,
    #[error("object identifier does not name a live record of this kind")]
    InvalidIdentifier,
}

/// CRUD contract over one entity kind.
#[async_trait]
pub trait Loader: Send + Sync {
    type Entity: ManagedEntity;
    type Query: Send + 'static;

    /// Returns the first match; `NotFound` when nothing matches.
    async fn get(&mut self, query: Option<Self::Query>) -> LoaderResult<Self::Entity>;

    /// Returns every match; `None` means unfiltered.
    async fn list(&self, query: Option<Self::Query>) -> LoaderResult<Vec<Self::Entity>>;

    async fn insert(&self, items: &[Self::Entity]) -> LoaderResult<()>;

    async fn update(&self, item: &Self::Entity) -> LoaderResult<()>;

    async fn delete(&self, item: &Self::Entity) -> LoaderResult<()>;
}

/// Loader for entity kind `E` bound to one context.
pub struct RecordLoader<E> {
    context: Context,
    fetch_request: FetchRequest,
    _entity: PhantomData<fn() -> E>,
}

impl<E: ManagedEntity> RecordLoader<E> {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            fetch_request: FetchRequest::new(E::ENTITY_NAME),
            _entity: PhantomData,
        }
    }

    /// Orders every subsequent fetch by `sort`, after any earlier sorts.
    pub fn with_sort(mut self, sort: SortDescriptor) -> Self {
        self.fetch_request = self.fetch_request.with_sort(sort);
        self
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn fetch_request(&self) -> &FetchRequest {
        &self.fetch_request
    }

    /// Identifier of `item` when it is registered in this loader's context.
    pub async fn object_id(&self, item: &E) -> Option<ObjectId> {
        self.context.object_id(item).await
    }

    /// Loads the live record named by an object URI.
    pub async fn resolve(&self, uri: &str) -> LoaderResult<E> {
        let object_id = match ObjectId::parse(uri) {
            Ok(object_id) if object_id.entity() == E::ENTITY_NAME => object_id,
            Ok(object_id) => {
                return Err(self.invalid("Resolve failed", &format!("{object_id} names another entity kind")));
            }
            Err(err) => return Err(self.invalid("Resolve failed", &err)),
        };

        let record = match self.context.existing_object(&object_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(self.invalid("Resolve failed", &format!("{object_id} has no live record"))),
            Err(err) => return Err(self.failed("Resolve failed", err)),
        };
        record
            .decode()
            .map_err(|err| self.failed("Resolve failed", err.into()))
    }

    fn failed(&self, title: &str, err: StoreError) -> LoaderError {
        log_entry(Level::Error, self.origin(), title, &[&E::ENTITY_NAME, &err]);
        LoaderError::OperationFailed(err)
    }

    fn succeeded(&self, title: &str, detail: &dyn Display) {
        log_entry(Level::Info, self.origin(), title, &[&E::ENTITY_NAME, detail]);
    }

    fn invalid(&self, title: &str, detail: &dyn Display) -> LoaderError {
        log_entry(Level::Error, self.origin(), title, &[&E::ENTITY_NAME, detail]);
        LoaderError::InvalidIdentifier
    }

    fn origin(&self) -> &'static str {
        if self.context.is_main() {
            "RecordLoader(main)"
        } else {
            "RecordLoader(background)"
        }
    }

    fn map_write_error(&self, title: &str, err: StoreError) -> LoaderError {
        match err {
            StoreError::NotRegistered(detail) => self.invalid(title, &detail),
            other => self.failed(title, other),
        }
    }

    async fn save_if_needed(&self, title: &str) -> LoaderResult<()> {
        self.context
            .save_if_needed()
            .await
            .map(|_| ())
            .map_err(|err| self.failed(title, err))
    }
}

#[async_trait]
impl<E: ManagedEntity> Loader for RecordLoader<E> {
    type Entity = E;
    type Query = Predicate;

    async fn get(&mut self, query: Option<Predicate>) -> LoaderResult<E> {
        self.fetch_request.fetch_limit = 1;
        let result = self.list(query).await;
        self.fetch_request.fetch_limit = 0;

        result?.into_iter().next().ok_or(LoaderError::NotFound)
    }

    async fn list(&self, query: Option<Predicate>) -> LoaderResult<Vec<E>> {
        let request = self.fetch_request.clone().with_predicate(query);
        let records = self
            .context
            .fetch(&request)
            .await
            .map_err(|err| self.failed("Fetch failed", err))?;

        let items = records
            .iter()
            .map(|record| record.decode::<E>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| self.failed("Fetch failed", err.into()))?;
        self.succeeded("Fetch succeeded", &format!("count={}", items.len()));
        Ok(items)
    }

    async fn insert(&self, items: &[E]) -> LoaderResult<()> {
        for item in items {
            self.context
                .insert(item)
                .await
                .map_err(|err| self.failed("Insert failed", err))?;
        }
        self.save_if_needed("Insert failed").await?;
        self.succeeded("Insert succeeded", &format!("count={}", items.len()));
        Ok(())
    }

    async fn update(&self, item: &E) -> LoaderResult<()> {
        self.context
            .update(item)
            .await
            .map_err(|err| self.map_write_error("Update failed", err))?;
        self.save_if_needed("Update failed").await?;
        self.succeeded("Update succeeded", &item.id());
        Ok(())
    }

    async fn delete(&self, item: &E) -> LoaderResult<()> {
        self.context
            .delete(item)
            .await
            .map_err(|err| self.map_write_error("Delete failed", err))?;
        self.save_if_needed("Delete failed").await?;
        self.succeeded("Delete succeeded", &item.id());
        Ok(())
    }
}
