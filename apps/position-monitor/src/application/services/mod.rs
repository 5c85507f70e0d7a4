//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `PositionMonitorService`: Registry refresh, reconciliation and stop escalation
//! - `ConnectionSupervisor`: Stream session lifecycle and reconnect backoff
//! - `CredentialManager`: Session credential creation and renewal
//! - `NotificationDispatcher`: Bounded drop-oldest notification queue
//! - `EventRouter`: Fans stream events out to the contexts that own them

use std::future::Future;
use std::time::Duration;

use crate::error::MonitorError;

pub mod credentials;
pub mod dispatcher;
pub mod heartbeat;
pub mod monitor;
pub mod router;
pub mod supervisor;

pub use credentials::{CredentialManager, RenewalConfig};
pub use dispatcher::{DispatcherConfig, DrainReport, NotificationDispatcher};
pub use heartbeat::{HeartbeatConfig, HeartbeatState, Liveness};
pub use monitor::{PositionMonitorConfig, PositionMonitorService, ReconcileReport, RefreshOutcome};
pub use router::{EventRouter, RouterChannels};
pub use supervisor::{
    ConnectionSupervisor, LifecycleSignal, SharedConnectionState, SupervisorChannels, SupervisorCommand,
    SupervisorConfig, SupervisorError,
};

/// Await `future` for at most `limit`; an elapsed timeout is a failure of
/// this call only.
pub(crate) async fn with_timeout<T, E>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, MonitorError>
where
    MonitorError: From<E>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(MonitorError::from),
        Err(_) => Err(MonitorError::Timeout(operation)),
    }
}
