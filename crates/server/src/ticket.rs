use crate::catalog::{Dataset, DatasetCatalog};
use crate::error::ServerError;
use arrow_flight::Ticket;
use std::collections::HashMap;

/// A ticket resolved back to the statement it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTicket<'a> {
    pub dataset: &'a str,
    pub sql: &'a str,
}

/// Maps opaque DoGet tickets to dataset statements.
///
/// The ticket for a dataset is its name, so issuing is deterministic and
/// tickets stay valid for the life of the process. Clients must not depend
/// on that encoding.
pub struct TicketRegistry {
    queries: HashMap<String, (String, String)>,
}

impl TicketRegistry {
    pub fn new(catalog: &DatasetCatalog) -> Self {
        let queries = catalog
            .list_datasets()
            .iter()
            .map(|d| {
                (
                    d.name().to_string(),
                    (d.name().to_string(), d.source_query().to_string()),
                )
            })
            .collect();
        Self { queries }
    }

    pub fn issue(&self, dataset: &str) -> Result<Ticket, ServerError> {
        if !self.queries.contains_key(dataset) {
            return Err(ServerError::DatasetNotFound(dataset.to_string()));
        }
        Ok(Ticket::new(dataset.to_string()))
    }

    /// Ticket for a dataset taken from the catalog this registry was built from.
    pub fn ticket_for(&self, dataset: &Dataset) -> Ticket {
        Ticket::new(dataset.name().to_string())
    }

    pub fn resolve(&self, ticket: &Ticket) -> Result<ResolvedTicket<'_>, ServerError> {
        let key = std::str::from_utf8(&ticket.ticket)
            .map_err(|_| ServerError::InvalidTicket("ticket is not valid UTF-8".to_string()))?;
        let (dataset, sql) = self
            .queries
            .get(key)
            .ok_or_else(|| ServerError::InvalidTicket(format!("unknown ticket '{}'", key)))?;
        Ok(ResolvedTicket { dataset, sql })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use arrow::datatypes::SchemaRef;
    use hangar_engine::{QueryEngine, QueryStream};
    use std::sync::Arc;

    struct NoEngine;

    #[async_trait]
    impl QueryEngine for NoEngine {
        async fn schema(&self, _sql: &str) -> hangar_common::Result<SchemaRef> {
            Err(hangar_common::Error::Closed)
        }

        async fn execute(&self, _sql: &str) -> hangar_common::Result<QueryStream> {
            Err(hangar_common::Error::Closed)
        }

        async fn close(&self) -> hangar_common::Result<()> {
            Ok(())
        }
    }

    fn registry() -> TicketRegistry {
        let catalog = DatasetCatalog::new(["orders", "sPlot"], Arc::new(NoEngine));
        TicketRegistry::new(&catalog)
    }

    #[test]
    fn test_issue_is_deterministic() {
        let registry = registry();
        let first = registry.issue("orders").unwrap();
        let second = registry.issue("orders").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, registry.issue("sPlot").unwrap());
    }

    #[test]
    fn test_resolve_issued_ticket() {
        let registry = registry();
        let ticket = registry.issue("sPlot").unwrap();
        let resolved = registry.resolve(&ticket).unwrap();
        assert_eq!(resolved.dataset, "sPlot");
        assert_eq!(resolved.sql, "SELECT * FROM sPlot");
    }

    #[test]
    fn test_ticket_for_catalog_dataset() {
        let catalog = DatasetCatalog::new(["orders", "sPlot"], Arc::new(NoEngine));
        let registry = TicketRegistry::new(&catalog);
        for dataset in catalog.list_datasets() {
            let ticket = registry.ticket_for(dataset);
            assert_eq!(ticket, registry.issue(dataset.name()).unwrap());
            assert_eq!(registry.resolve(&ticket).unwrap().dataset, dataset.name());
        }
    }

    #[test]
    fn test_issue_unknown_dataset() {
        assert!(matches!(
            registry().issue("missing_table"),
            Err(ServerError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_forged_tickets() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&Ticket::new("DROP TABLE orders")),
            Err(ServerError::InvalidTicket(_))
        ));
        assert!(matches!(
            registry.resolve(&Ticket::new(vec![0xff, 0xfe])),
            Err(ServerError::InvalidTicket(_))
        ));
        assert!(matches!(
            registry.resolve(&Ticket::new("")),
            Err(ServerError::InvalidTicket(_))
        ));
    }
}
