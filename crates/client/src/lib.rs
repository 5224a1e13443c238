//! Client for a Hangar dataset server.
//!
//! Wraps the generated Flight client with the dataset-oriented calls the
//! server supports: listing datasets, fetching schemas, streaming rows and
//! invoking server actions.

use arrow::datatypes::{Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightDescriptor, FlightInfo, HandshakeRequest, Ticket,
};
use futures::stream::{self, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid server address '{0}'")]
    InvalidAddress(String),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Server returned {:?}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    #[error("Flight error: {0}")]
    Flight(#[from] FlightError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Dataset {0} has no ticket")]
    NoTicket(String),

    #[error("Server sent an empty handshake response")]
    EmptyHandshake,
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A dataset as advertised by `ListFlights`.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    /// `None` when the server could not compute the schema.
    pub schema: Option<Schema>,
    pub ticket: Option<Ticket>,
}

impl DatasetInfo {
    fn from_flight_info(info: FlightInfo) -> Self {
        let name = info
            .flight_descriptor
            .as_ref()
            .map(|d| d.path.join("/"))
            .unwrap_or_default();
        let ticket = info.endpoint.first().and_then(|e| e.ticket.clone());
        let schema = if info.schema.is_empty() {
            None
        } else {
            info.try_decode_schema().ok()
        };
        Self {
            name,
            schema,
            ticket,
        }
    }
}

#[derive(Clone)]
pub struct HangarClient {
    inner: FlightServiceClient<Channel>,
}

impl HangarClient {
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let channel = Endpoint::from_shared(addr.clone())
            .map_err(|_| ClientError::InvalidAddress(addr))?
            .connect_timeout(Duration::from_secs(5))
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: FlightServiceClient::new(channel),
        }
    }

    /// Sends a single handshake message and returns the server's payload.
    pub async fn handshake(&mut self, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let request = HandshakeRequest {
            protocol_version: 0,
            payload: payload.into().into(),
        };
        let mut responses = self
            .inner
            .handshake(stream::iter(vec![request]))
            .await?
            .into_inner();
        let response = responses
            .message()
            .await?
            .ok_or(ClientError::EmptyHandshake)?;
        Ok(response.payload.to_vec())
    }

    pub async fn list_datasets(&mut self) -> Result<Vec<DatasetInfo>> {
        let flights: Vec<FlightInfo> = self
            .inner
            .list_flights(Criteria::default())
            .await?
            .into_inner()
            .try_collect()
            .await?;
        Ok(flights
            .into_iter()
            .map(DatasetInfo::from_flight_info)
            .collect())
    }

    pub async fn list_actions(&mut self) -> Result<Vec<ActionType>> {
        Ok(self
            .inner
            .list_actions(Empty {})
            .await?
            .into_inner()
            .try_collect()
            .await?)
    }

    /// Runs a server action and returns the result bodies.
    pub async fn do_action(&mut self, action: &str) -> Result<Vec<Vec<u8>>> {
        let results: Vec<arrow_flight::Result> = self
            .inner
            .do_action(Action::new(action, ""))
            .await?
            .into_inner()
            .try_collect()
            .await?;
        Ok(results.into_iter().map(|r| r.body.to_vec()).collect())
    }

    pub async fn schema(&mut self, dataset: &str) -> Result<Schema> {
        let result = self
            .inner
            .get_schema(descriptor(dataset))
            .await?
            .into_inner();
        Ok(Schema::try_from(&result)?)
    }

    pub async fn flight_info(&mut self, dataset: &str) -> Result<FlightInfo> {
        Ok(self
            .inner
            .get_flight_info(descriptor(dataset))
            .await?
            .into_inner())
    }

    /// Resolves `dataset` to a ticket and streams every batch into memory.
    pub async fn fetch(&mut self, dataset: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let info = self.flight_info(dataset).await?;
        let ticket = info
            .endpoint
            .first()
            .and_then(|e| e.ticket.clone())
            .ok_or_else(|| ClientError::NoTicket(dataset.to_string()))?;
        let advertised = info.try_decode_schema().map(Arc::new);

        let (schema, batches) = self.fetch_ticket(ticket).await?;
        let schema = match (schema, advertised) {
            (Some(schema), _) => schema,
            (None, Ok(schema)) => schema,
            (None, Err(e)) => return Err(e.into()),
        };
        debug!("Fetched {} batches of '{}'", batches.len(), dataset);
        Ok((schema, batches))
    }

    /// Redeems a ticket. The schema is `None` only if the server sent nothing.
    pub async fn fetch_ticket(
        &mut self,
        ticket: Ticket,
    ) -> Result<(Option<SchemaRef>, Vec<RecordBatch>)> {
        let flight_data = self.inner.do_get(ticket).await?.into_inner();
        let mut stream =
            FlightRecordBatchStream::new_from_flight_data(flight_data.map_err(FlightError::from));

        let mut batches = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            batches.push(batch);
        }
        Ok((stream.schema().cloned(), batches))
    }
}

fn descriptor(dataset: &str) -> FlightDescriptor {
    FlightDescriptor::new_path(vec![dataset.to_string()])
}
