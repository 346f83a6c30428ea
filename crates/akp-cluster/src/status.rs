//! Status polling against the remote API
//!
//! The backend reconciles asynchronously; callers block here until the
//! requested dimension reaches a terminal code. There is no timeout or
//! attempt cap; the caller bounds the wait with its cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use akp_common::{Error, Result};

use crate::api::{ClusterApi, ClusterRecord};

/// Which status a caller is waiting on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusDimension {
    /// Backend reconciliation; terminal on SUCCESSFUL or FAILED
    Reconciliation,
    /// Agent health; terminal on HEALTHY or DEGRADED
    Health,
}

impl StatusDimension {
    /// Whether the record's status for this dimension is terminal
    pub fn is_terminal(&self, record: &ClusterRecord) -> bool {
        match self {
            StatusDimension::Reconciliation => record.reconciliation_status.code.is_terminal(),
            StatusDimension::Health => record.health_status.code.is_terminal(),
        }
    }

    fn code(&self, record: &ClusterRecord) -> String {
        match self {
            StatusDimension::Reconciliation => record.reconciliation_status.code.to_string(),
            StatusDimension::Health => record.health_status.code.to_string(),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            StatusDimension::Reconciliation => "wait_for_reconciliation",
            StatusDimension::Health => "wait_for_health",
        }
    }
}

/// Run a future unless the token fires first.
///
/// Cancellation is checked before the future is polled, so an already
/// cancelled token never starts the call.
pub async fn with_cancellation<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        result = fut => result,
    }
}

/// Polls a cluster record until a status dimension is terminal
pub struct StatusPoller {
    api: Arc<dyn ClusterApi>,
    organization_id: String,
    poll_interval: Duration,
}

impl StatusPoller {
    /// Create a poller
    pub fn new(
        api: Arc<dyn ClusterApi>,
        organization_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            organization_id: organization_id.into(),
            poll_interval,
        }
    }

    /// Fetch the record and wait until `dimension` is terminal
    pub async fn wait_for(
        &self,
        instance_id: &str,
        id: &str,
        dimension: StatusDimension,
        cancel: &CancellationToken,
    ) -> Result<ClusterRecord> {
        let record = with_cancellation(
            cancel,
            dimension.operation(),
            self.api.get_cluster(&self.organization_id, instance_id, id),
        )
        .await?;
        self.wait_from(instance_id, record, dimension, cancel).await
    }

    /// Wait until `dimension` is terminal, starting from an already fetched record
    ///
    /// Returns immediately when `record` is already terminal.
    #[instrument(skip_all, fields(cluster = %record.id, dimension = ?dimension))]
    pub async fn wait_from(
        &self,
        instance_id: &str,
        mut record: ClusterRecord,
        dimension: StatusDimension,
        cancel: &CancellationToken,
    ) -> Result<ClusterRecord> {
        let operation = dimension.operation();
        let id = record.id.clone();
        let mut last_code = dimension.code(&record);

        while !dimension.is_terminal(&record) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            record = with_cancellation(
                cancel,
                operation,
                self.api.get_cluster(&self.organization_id, instance_id, &id),
            )
            .await?;

            let code = dimension.code(&record);
            if code != last_code {
                debug!(from = %last_code, to = %code, "cluster status changed");
                last_code = code;
            }
        }

        Ok(record)
    }
}
