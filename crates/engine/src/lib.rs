//! Engine crate
//!
//! The query capability the Flight service is written against, and the
//! DataFusion-backed implementation used by the server.
//!
//! # Example
//! ```rust,no_run
//! use hangar_engine::{DataFusionEngine, QueryEngine};
//! # async fn run() -> hangar_common::Result<()> {
//! let engine = DataFusionEngine::new();
//! let batches = engine.execute("SELECT 42 AS answer").await?.collect().await?;
//! assert_eq!(batches[0].num_rows(), 1);
//! # Ok(())
//! # }
//! ```

pub mod session;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use hangar_common::{Error, Result};

pub use session::{DataFusionEngine, EngineOptions};

/// Ordered, lazily produced batches of one statement.
pub type BatchStream = BoxStream<'static, Result<RecordBatch>>;

/// The result of executing a statement: its schema plus the batch stream.
pub struct QueryStream {
    schema: SchemaRef,
    batches: BatchStream,
}

impl QueryStream {
    pub fn new(schema: SchemaRef, batches: BatchStream) -> Self {
        Self { schema, batches }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn into_parts(self) -> (SchemaRef, BatchStream) {
        (self.schema, self.batches)
    }

    /// Drains the stream into memory. Intended for tests and small results.
    pub async fn collect(self) -> Result<Vec<RecordBatch>> {
        self.batches.try_collect().await
    }
}

/// SQL execution capability consumed by the dataset service.
///
/// Implementations must be safe to call from many tasks at once; any
/// serialization the underlying engine needs happens behind this trait.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Plans `sql` and returns its result schema without producing rows.
    async fn schema(&self, sql: &str) -> Result<SchemaRef>;

    /// Executes `sql`. Batches are produced on demand as the stream is polled.
    async fn execute(&self, sql: &str) -> Result<QueryStream>;

    /// Re-reads every registered dataset from its source.
    async fn reload(&self) -> Result<()> {
        Err(Error::NotSupported("reload".to_string()))
    }

    /// Releases engine resources. Later statements fail with [`Error::Closed`].
    async fn close(&self) -> Result<()>;
}
