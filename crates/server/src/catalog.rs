use crate::error::ServerError;
use arrow::datatypes::SchemaRef;
use arrow_flight::flight_descriptor::DescriptorType;
use arrow_flight::FlightDescriptor;
use hangar_engine::QueryEngine;
use std::sync::Arc;

/// A dataset the server publishes, and the statements used to serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    name: String,
    source_query: String,
    schema_query: String,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_query: format!("SELECT * FROM {}", name),
            schema_query: format!("SELECT * FROM {} LIMIT 1", name),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statement producing every row of the dataset.
    pub fn source_query(&self) -> &str {
        &self.source_query
    }

    /// Statement used only to plan the dataset's schema.
    pub fn schema_query(&self) -> &str {
        &self.schema_query
    }

    pub fn descriptor(&self) -> FlightDescriptor {
        FlightDescriptor::new_path(vec![self.name.clone()])
    }
}

/// Ordered set of published datasets, fixed at startup.
pub struct DatasetCatalog {
    datasets: Vec<Dataset>,
    engine: Arc<dyn QueryEngine>,
}

impl DatasetCatalog {
    pub fn new<I, S>(names: I, engine: Arc<dyn QueryEngine>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            datasets: names.into_iter().map(Dataset::new).collect(),
            engine,
        }
    }

    /// Datasets in configuration order.
    pub fn list_datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn get(&self, name: &str) -> Result<&Dataset, ServerError> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ServerError::DatasetNotFound(name.to_string()))
    }

    pub fn describe(&self, name: &str) -> Result<FlightDescriptor, ServerError> {
        Ok(self.get(name)?.descriptor())
    }

    /// Finds the dataset a client descriptor refers to.
    ///
    /// Only a path of exactly one element names a dataset. Command
    /// descriptors never match.
    pub fn resolve_descriptor(&self, descriptor: &FlightDescriptor) -> Result<&Dataset, ServerError> {
        if descriptor.r#type() == DescriptorType::Cmd {
            return Err(ServerError::DatasetNotFound(format!(
                "<command {}>",
                String::from_utf8_lossy(&descriptor.cmd)
            )));
        }
        match descriptor.path.as_slice() {
            [name] => self.get(name),
            path => Err(ServerError::DatasetNotFound(path.join("/"))),
        }
    }

    /// Plans the dataset's schema through the engine without reading rows.
    pub async fn schema_of(&self, name: &str) -> Result<SchemaRef, ServerError> {
        let dataset = self.get(name)?;
        self.engine
            .schema(dataset.schema_query())
            .await
            .map_err(|source| ServerError::QueryFailure {
                dataset: dataset.name.clone(),
                source,
            })
    }
}
