use crate::catalog::{Dataset, DatasetCatalog};
use crate::config::Settings;
use crate::error::ServerError;
use crate::ticket::TicketRegistry;
use arrow::ipc::writer::IpcWriteOptions;
use arrow::record_batch::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint,
    FlightInfo, HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc,
    SchemaResult, Ticket,
};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use hangar_engine::{BatchStream, QueryEngine};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

pub const ACTION_RELOAD: &str = "reload";
pub const ACTION_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub channel_capacity: usize,
    pub expose_engine_errors: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 2,
            expose_engine_errors: false,
        }
    }
}

impl From<&Settings> for ServiceOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            channel_capacity: settings.stream.channel_capacity,
            expose_engine_errors: settings.expose_engine_errors,
        }
    }
}

/// Arrow Flight front end over a fixed set of named datasets.
#[derive(Clone)]
pub struct HangarFlightService {
    catalog: Arc<DatasetCatalog>,
    tickets: Arc<TicketRegistry>,
    engine: Arc<dyn QueryEngine>,
    options: ServiceOptions,
    shutdown_requests: Arc<Notify>,
    cancel: Arc<watch::Sender<bool>>,
}

impl HangarFlightService {
    pub fn new<I, S>(datasets: I, engine: Arc<dyn QueryEngine>, options: ServiceOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let catalog = DatasetCatalog::new(datasets, engine.clone());
        let tickets = TicketRegistry::new(&catalog);
        Self {
            catalog: Arc::new(catalog),
            tickets: Arc::new(tickets),
            engine,
            options: ServiceOptions {
                channel_capacity: options.channel_capacity.max(1),
                ..options
            },
            shutdown_requests: Arc::new(Notify::new()),
            cancel: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn catalog(&self) -> &DatasetCatalog {
        &self.catalog
    }

    /// Notified once per `shutdown` action.
    pub fn shutdown_requests(&self) -> Arc<Notify> {
        self.shutdown_requests.clone()
    }

    /// Ends every running DoGet stream with `Unavailable` and refuses new ones.
    pub fn cancel_streams(&self) {
        if !self.cancel.send_replace(true) {
            info!("Cancelling in-flight DoGet streams");
        }
    }

    fn reject(&self, operation: &str, err: ServerError) -> Status {
        warn!("{} failed: {}", operation, err);
        err.into_status(self.options.expose_engine_errors)
    }

    /// FlightInfo for `dataset` with the schema field left empty.
    fn base_info(&self, dataset: &Dataset) -> FlightInfo {
        FlightInfo::new()
            .with_descriptor(dataset.descriptor())
            .with_endpoint(FlightEndpoint::new().with_ticket(self.tickets.ticket_for(dataset)))
            .with_ordered(true)
    }
}

#[tonic::async_trait]
impl FlightService for HangarFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        let first = request
            .into_inner()
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("handshake stream was empty"))?;
        info!(
            "Handshake: protocol version {}, {} byte payload",
            first.protocol_version,
            first.payload.len()
        );

        let payload = if first.payload.is_empty() {
            "ok".into()
        } else {
            first.payload
        };
        let response = HandshakeResponse {
            protocol_version: first.protocol_version,
            payload,
        };
        Ok(Response::new(stream::once(async { Ok(response) }).boxed()))
    }

    async fn list_flights(
        &self,
        request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let criteria = request.into_inner();
        if criteria.expression.is_empty() {
            debug!("ListFlights");
        } else {
            // criteria are advisory, every dataset is listed
            info!(
                "ListFlights with criteria '{}'",
                String::from_utf8_lossy(&criteria.expression)
            );
        }

        let mut flights = Vec::with_capacity(self.catalog.list_datasets().len());
        for dataset in self.catalog.list_datasets() {
            let schema = match self.catalog.schema_of(dataset.name()).await {
                Ok(schema) => Some(schema),
                Err(e) => {
                    warn!(
                        "ListFlights: listing dataset '{}' without a schema: {}",
                        dataset.name(),
                        e
                    );
                    None
                }
            };
            let base = self.base_info(dataset);
            let info = match schema {
                Some(schema) => base.clone().try_with_schema(&schema).unwrap_or_else(|e| {
                    warn!(
                        "ListFlights: could not encode schema of '{}': {}",
                        dataset.name(),
                        e
                    );
                    base
                }),
                None => base,
            };
            flights.push(Ok(info));
        }

        Ok(Response::new(stream::iter(flights).boxed()))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        let dataset = self
            .catalog
            .resolve_descriptor(&descriptor)
            .map_err(|e| self.reject("GetFlightInfo", e))?;
        let schema = self
            .catalog
            .schema_of(dataset.name())
            .await
            .map_err(|e| self.reject("GetFlightInfo", e))?;
        let info = self
            .base_info(dataset)
            .try_with_schema(&schema)
            .map_err(|e| self.reject("GetFlightInfo", ServerError::Arrow(e)))?;
        debug!("GetFlightInfo: '{}'", dataset.name());
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(self.reject("PollFlightInfo", ServerError::NotImplemented("PollFlightInfo")))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = request.into_inner();
        let dataset = self
            .catalog
            .resolve_descriptor(&descriptor)
            .map_err(|e| self.reject("GetSchema", e))?;
        let schema = self
            .catalog
            .schema_of(dataset.name())
            .await
            .map_err(|e| self.reject("GetSchema", e))?;

        let options = IpcWriteOptions::default();
        let result: SchemaResult = SchemaAsIpc::new(&schema, &options)
            .try_into()
            .map_err(|e| self.reject("GetSchema", ServerError::Arrow(e)))?;
        Ok(Response::new(result))
    }

    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        if *self.cancel.borrow() {
            return Err(self.reject("DoGet", ServerError::ShuttingDown));
        }
        let ticket = request.into_inner();
        let resolved = self
            .tickets
            .resolve(&ticket)
            .map_err(|e| self.reject("DoGet", e))?;
        let dataset = resolved.dataset.to_string();

        let query = self.engine.execute(resolved.sql).await.map_err(|source| {
            self.reject(
                "DoGet",
                ServerError::QueryFailure {
                    dataset: dataset.clone(),
                    source,
                },
            )
        })?;
        let (schema, batches) = query.into_parts();
        info!("DoGet: streaming dataset '{}'", dataset);

        let (tx, rx) = mpsc::channel(self.options.channel_capacity);
        tokio::spawn(forward_batches(
            dataset,
            batches,
            tx,
            self.cancel.subscribe(),
            self.options.expose_engine_errors,
        ));

        let stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(ReceiverStream::new(rx))
            .map_err(Status::from)
            .boxed();
        Ok(Response::new(stream))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(self.reject("DoPut", ServerError::NotImplemented("DoPut")))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = request.into_inner();
        let body = match action.r#type.as_str() {
            ACTION_RELOAD => {
                self.engine
                    .reload()
                    .await
                    .map_err(|e| self.reject("DoAction(reload)", ServerError::Engine(e)))?;
                info!("Reloaded {} datasets", self.catalog.list_datasets().len());
                "reloaded"
            }
            ACTION_SHUTDOWN => {
                info!("Shutdown requested by client");
                self.shutdown_requests.notify_one();
                "shutting down"
            }
            other => {
                warn!("DoAction: unknown action '{}'", other);
                return Err(Status::unimplemented(format!("Unknown action: {}", other)));
            }
        };

        let result = arrow_flight::Result {
            body: body.into(),
        };
        Ok(Response::new(stream::once(async { Ok(result) }).boxed()))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![
            Ok(ActionType {
                r#type: ACTION_RELOAD.to_string(),
                description: "Re-read every dataset from its source".to_string(),
            }),
            Ok(ActionType {
                r#type: ACTION_SHUTDOWN.to_string(),
                description: "Stop the server gracefully".to_string(),
            }),
        ];
        Ok(Response::new(stream::iter(actions).boxed()))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(self.reject("DoExchange", ServerError::NotImplemented("DoExchange")))
    }
}

/// Moves batches from the engine into the DoGet channel.
///
/// Stops at the first engine error, which is forwarded as the last item, as
/// soon as the receiving side is gone, or when `cancel` flips to true. A
/// cancelled stream is released immediately and the client is sent
/// `Unavailable` if there is room for it.
pub(crate) async fn forward_batches(
    dataset: String,
    mut batches: BatchStream,
    tx: mpsc::Sender<Result<RecordBatch, FlightError>>,
    mut cancel: watch::Receiver<bool>,
    expose_engine_errors: bool,
) {
    let mut sent = 0usize;
    let mut rows = 0usize;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                info!("DoGet: client left '{}' after {} batches", dataset, sent);
                return;
            }
            _ = cancelled(&mut cancel) => break,
            next = batches.next() => next,
        };

        match next {
            Some(Ok(batch)) => {
                let num_rows = batch.num_rows();
                let delivered = tokio::select! {
                    _ = cancelled(&mut cancel) => break,
                    delivered = tx.send(Ok(batch)) => delivered,
                };
                if delivered.is_err() {
                    info!("DoGet: client left '{}' after {} batches", dataset, sent);
                    return;
                }
                sent += 1;
                rows += num_rows;
            }
            Some(Err(source)) => {
                let err = ServerError::QueryFailure {
                    dataset: dataset.clone(),
                    source,
                };
                error!("DoGet: {} (after {} batches)", err, sent);
                drop(batches);
                let status = err.into_status(expose_engine_errors);
                tokio::select! {
                    _ = cancelled(&mut cancel) => {}
                    _ = tx.send(Err(FlightError::from(status))) => {}
                }
                return;
            }
            None => {
                info!(
                    "DoGet: finished '{}' ({} batches, {} rows)",
                    dataset, sent, rows
                );
                return;
            }
        }
    }

    drop(batches);
    warn!("DoGet: cancelled '{}' after {} batches", dataset, sent);
    let status = ServerError::ShuttingDown.into_status(expose_engine_errors);
    let _ = tx.try_send(Err(FlightError::from(status)));
}

/// Completes once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow_flight::decode::FlightRecordBatchStream;
    use hangar_engine::DataFusionEngine;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tonic::Code;

    fn orders_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("amount", DataType::Float64, false),
        ]))
    }

    fn orders_batch(ids: Vec<i64>) -> RecordBatch {
        let amounts = ids.iter().map(|id| *id as f64 * 1.5).collect::<Vec<_>>();
        RecordBatch::try_new(
            orders_schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Float64Array::from(amounts)),
            ],
        )
        .unwrap()
    }

    async fn orders_service() -> HangarFlightService {
        let engine = Arc::new(DataFusionEngine::new());
        engine
            .register_batches("orders", orders_schema(), vec![orders_batch(vec![1, 2, 3])])
            .await
            .unwrap();
        HangarFlightService::new(["orders"], engine, ServiceOptions::default())
    }

    #[tokio::test]
    async fn test_get_flight_info_for_orders() {
        let service = orders_service().await;
        let descriptor = FlightDescriptor::new_path(vec!["orders".to_string()]);

        let info = service
            .get_flight_info(Request::new(descriptor.clone()))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(info.flight_descriptor, Some(descriptor));
        assert_eq!(info.endpoint.len(), 1);
        assert!(info.endpoint[0].location.is_empty());
        assert_eq!(info.total_records, -1);
        assert_eq!(info.total_bytes, -1);
        assert!(info.ordered);

        let schema = info.try_decode_schema().unwrap();
        assert_eq!(schema.fields(), orders_schema().fields());
    }

    #[tokio::test]
    async fn test_get_flight_info_unknown_dataset() {
        let service = orders_service().await;
        let err = service
            .get_flight_info(Request::new(FlightDescriptor::new_path(vec![
                "missing_table".to_string(),
            ])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_do_get_streams_rows() {
        let service = orders_service().await;
        let ticket = service.tickets.issue("orders").unwrap();

        let response = service.do_get(Request::new(ticket)).await.unwrap();
        let flight_data = response.into_inner().map_err(FlightError::from);
        let batches: Vec<RecordBatch> = FlightRecordBatchStream::new_from_flight_data(flight_data)
            .try_collect()
            .await
            .unwrap();

        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_do_get_unknown_ticket() {
        let service = orders_service().await;
        let err = match service.do_get(Request::new(Ticket::new("nope"))).await {
            Ok(_) => panic!("unknown ticket should be rejected"),
            Err(status) => status,
        };
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_actions() {
        let service = orders_service().await;
        let actions: Vec<ActionType> = service
            .list_actions(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<&str> = actions.iter().map(|a| a.r#type.as_str()).collect();
        assert_eq!(names, vec![ACTION_RELOAD, ACTION_SHUTDOWN]);
    }

    #[tokio::test]
    async fn test_shutdown_action_notifies() {
        let service = orders_service().await;
        let notify = service.shutdown_requests();

        let results: Vec<arrow_flight::Result> = service
            .do_action(Request::new(Action::new(ACTION_SHUTDOWN, "")))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .expect("shutdown request should be observable");
    }

    #[tokio::test]
    async fn test_unknown_action_is_unimplemented() {
        let service = orders_service().await;
        let err = match service
            .do_action(Request::new(Action::new("CancelFlightInfo", "")))
            .await
        {
            Ok(_) => panic!("unknown action should be rejected"),
            Err(status) => status,
        };
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_poll_flight_info_is_unimplemented() {
        let service = orders_service().await;
        let err = service
            .poll_flight_info(Request::new(FlightDescriptor::new_path(vec![
                "orders".to_string(),
            ])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_producer_stops_when_consumer_is_dropped() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let batches: BatchStream = stream::iter(0..)
            .map(move |i: i64| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(orders_batch(vec![i]))
            })
            .boxed();

        let (tx, mut rx) = mpsc::channel(2);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let producer = tokio::spawn(forward_batches(
            "orders".to_string(),
            batches,
            tx,
            cancel_rx,
            false,
        ));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.num_rows(), 1);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer should stop once the consumer is gone")
            .unwrap();
        // one received, at most two buffered, at most one in hand
        assert!(pulled.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_producer_forwards_engine_error_last() {
        let batches: BatchStream = stream::iter(vec![
            Ok(orders_batch(vec![1])),
            Err(hangar_common::Error::execution("disk on fire")),
            Ok(orders_batch(vec![2])),
        ])
        .boxed();

        let (tx, rx) = mpsc::channel(2);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        forward_batches("orders".to_string(), batches, tx, cancel_rx, false).await;

        let mut items: Vec<Result<RecordBatch, FlightError>> =
            ReceiverStream::new(rx).collect().await;
        assert_eq!(items.len(), 2);
        let last = items.pop().unwrap();
        assert!(items[0].is_ok());
        let status = Status::from(last.unwrap_err());
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_cancel_releases_pending_stream() {
        struct Released(Arc<AtomicBool>);
        impl Drop for Released {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let guard = Released(released.clone());
        let batches: BatchStream = stream::once(async { Ok::<_, hangar_common::Error>(orders_batch(vec![1])) })
            .chain(stream::pending())
            .map(move |batch| {
                let _held = &guard;
                batch
            })
            .boxed();

        let (tx, mut rx) = mpsc::channel(2);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let producer = tokio::spawn(forward_batches(
            "orders".to_string(),
            batches,
            tx,
            cancel_rx,
            false,
        ));

        assert!(rx.recv().await.unwrap().is_ok());
        cancel_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer should stop once cancelled")
            .unwrap();
        assert!(released.load(Ordering::SeqCst));

        let status = Status::from(rx.recv().await.unwrap().unwrap_err());
        assert_eq!(status.code(), Code::Unavailable);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_do_get_refused_after_cancel() {
        let service = orders_service().await;
        let ticket = service.tickets.issue("orders").unwrap();
        service.cancel_streams();

        let err = match service.do_get(Request::new(ticket)).await {
            Ok(_) => panic!("DoGet should be refused while shutting down"),
            Err(status) => status,
        };
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_list_flights_keeps_datasets_without_schema() {
        let engine = Arc::new(DataFusionEngine::new());
        engine
            .register_batches("orders", orders_schema(), vec![orders_batch(vec![1, 2, 3])])
            .await
            .unwrap();
        let service =
            HangarFlightService::new(["orders", "ghost"], engine, ServiceOptions::default());

        let flights: Vec<FlightInfo> = service
            .list_flights(Request::new(Criteria::default()))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(flights.len(), 2);

        let orders = &flights[0];
        assert_eq!(
            orders.clone().try_decode_schema().unwrap().fields(),
            orders_schema().fields()
        );

        let ghost = &flights[1];
        assert_eq!(
            ghost.flight_descriptor,
            Some(FlightDescriptor::new_path(vec!["ghost".to_string()]))
        );
        assert!(ghost.schema.is_empty());
        let ticket = ghost.endpoint[0].ticket.clone().unwrap();
        assert_eq!(service.tickets.resolve(&ticket).unwrap().dataset, "ghost");
    }
}
