//! Scripted peripheral interactions
//!
//! A [`PeripheralOperation`] describes what to do with a peripheral once a
//! session is up. [`run_operation`] owns the lifecycle: start the session,
//! execute the body, end the session and report one aggregated result.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::SessionConfiguration;
use crate::error::BleResult;
use crate::peripheral::Peripheral;
use crate::session::PeripheralSession;

#[async_trait]
pub trait PeripheralOperation: Send {
    type Output: Send;

    /// Session setup used for this operation
    fn configuration(&self) -> SessionConfiguration {
        SessionConfiguration::default()
    }

    /// Body of the operation, run against a started session
    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<Self::Output>;
}

/// Run `operation` against `peripheral`.
///
/// Fails with the first error that ended the session: a start failure, an
/// error returned by `execute`, or a fatal error the body swallowed. An error
/// that only shows up while disconnecting after a successful body is logged
/// and does not discard the output.
pub async fn run_operation<O>(peripheral: &Peripheral, operation: &mut O) -> BleResult<O::Output>
where
    O: PeripheralOperation + ?Sized,
{
    let mut session = PeripheralSession::new(peripheral.clone(), operation.configuration());
    session.start().await?;

    debug!(device = %peripheral.id(), "Executing operation");
    let result = operation.execute(&mut session).await;
    let forced = session.end_error();

    let end_error = session.end(result.as_ref().err().cloned()).await;
    match (result, forced) {
        (Err(err), _) => Err(err),
        (Ok(_), Some(err)) => Err(err),
        (Ok(output), None) => {
            match end_error {
                Some(err) => warn!(device = %peripheral.id(), "Operation succeeded but disconnect reported: {}", err),
                None => info!(device = %peripheral.id(), "Operation finished"),
            }
            Ok(output)
        }
    }
}
