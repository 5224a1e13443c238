//! DataFusion implementation of [`QueryEngine`].

use crate::{QueryEngine, QueryStream};
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::{MemTable, TableProvider};
use datafusion::execution::context::{SQLOptions, SessionContext};
use datafusion::physical_plan::RecordBatchStream;
use datafusion::prelude::{CsvReadOptions, DataFrame, ParquetReadOptions};
use futures::StreamExt;
use hangar_common::{DatasetSource, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on statements running at once, result streams included.
    pub max_concurrent_statements: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrent_statements: 16,
        }
    }
}

#[derive(Clone)]
enum Registration {
    Source(DatasetSource),
    Batches {
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    },
}

/// A [`SessionContext`] shared by every call.
///
/// `SessionContext` is safe to use concurrently. Statements are still
/// admitted through a semaphore so the number of live result streams stays
/// bounded; a statement keeps its permit until its stream is dropped.
pub struct DataFusionEngine {
    ctx: SessionContext,
    permits: Arc<Semaphore>,
    registrations: RwLock<Vec<(String, Registration)>>,
}

impl Default for DataFusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionEngine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            ctx: SessionContext::new(),
            permits: Arc::new(Semaphore::new(options.max_concurrent_statements.max(1))),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Registers a file-backed dataset under `name`.
    pub async fn register_source(&self, name: &str, source: &DatasetSource) -> Result<()> {
        self.register(name, Registration::Source(source.clone())).await?;
        info!("Registered dataset '{}' from {}", name, source);
        Ok(())
    }

    /// Registers in-memory batches under `name`.
    pub async fn register_batches(
        &self,
        name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        self.register(name, Registration::Batches { schema, batches })
            .await?;
        info!("Registered in-memory dataset '{}' with {} rows", name, rows);
        Ok(())
    }

    async fn register(&self, name: &str, registration: Registration) -> Result<()> {
        if self.permits.is_closed() {
            return Err(Error::Closed);
        }
        let mut registrations = self.registrations.write().await;
        if registrations.iter().any(|(existing, _)| existing == name) {
            return Err(Error::execution(format!(
                "dataset {} is already registered",
                name
            )));
        }
        self.load(name, &registration).await?;
        registrations.push((name.to_string(), registration));
        Ok(())
    }

    async fn load(&self, name: &str, registration: &Registration) -> Result<()> {
        let provider = self.provider(registration).await?;
        self.ctx.register_table(name, provider)?;
        Ok(())
    }

    /// Builds the table for `registration` without touching the catalog.
    async fn provider(&self, registration: &Registration) -> Result<Arc<dyn TableProvider>> {
        let provider = match registration {
            Registration::Source(DatasetSource::Parquet { path }) => {
                let extension = file_extension(path);
                let options = ParquetReadOptions {
                    file_extension: &extension,
                    ..Default::default()
                };
                self.ctx.read_parquet(path.as_str(), options).await?.into_view()
            }
            Registration::Source(DatasetSource::Csv { path, has_header }) => {
                let extension = file_extension(path);
                let options = CsvReadOptions::new()
                    .has_header(*has_header)
                    .file_extension(&extension);
                self.ctx.read_csv(path.as_str(), options).await?.into_view()
            }
            Registration::Batches { schema, batches } => {
                Arc::new(MemTable::try_new(schema.clone(), vec![batches.clone()])?)
            }
        };
        Ok(provider)
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)
    }

    async fn plan(&self, sql: &str) -> Result<DataFrame> {
        let options = SQLOptions::new()
            .with_allow_ddl(false)
            .with_allow_dml(false)
            .with_allow_statements(false);
        Ok(self.ctx.sql_with_options(sql, options).await?)
    }
}

fn file_extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

#[async_trait]
impl QueryEngine for DataFusionEngine {
    async fn schema(&self, sql: &str) -> Result<SchemaRef> {
        let _permit = self.admit().await?;
        debug!("Planning statement: {}", sql);
        let df = self.plan(sql).await?;
        Ok(Arc::clone(df.schema().inner()))
    }

    async fn execute(&self, sql: &str) -> Result<QueryStream> {
        let permit = self.admit().await?;
        debug!("Executing statement: {}", sql);
        let stream = self.plan(sql).await?.execute_stream().await?;
        let schema = stream.schema();
        let batches = stream
            .map(move |batch| {
                let _held = &permit;
                batch.map_err(Error::from)
            })
            .boxed();
        Ok(QueryStream::new(schema, batches))
    }

    async fn reload(&self) -> Result<()> {
        if self.permits.is_closed() {
            return Err(Error::Closed);
        }
        let registrations = self.registrations.write().await;

        // every source must load before any table is replaced
        let mut providers = Vec::with_capacity(registrations.len());
        for (name, registration) in registrations.iter() {
            match self.provider(registration).await {
                Ok(provider) => providers.push(provider),
                Err(e) => {
                    warn!("Reload of '{}' failed, keeping current tables: {}", name, e);
                    return Err(e);
                }
            }
        }

        for ((name, _), provider) in registrations.iter().zip(providers) {
            self.ctx.deregister_table(name.as_str())?;
            self.ctx.register_table(name.as_str(), provider)?;
            info!("Reloaded dataset '{}'", name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.permits.is_closed() {
            return Ok(());
        }
        self.permits.close();
        let mut registrations = self.registrations.write().await;
        for (name, _) in registrations.drain(..) {
            self.ctx.deregister_table(name.as_str())?;
        }
        info!("Query engine closed");
        Ok(())
    }
}
