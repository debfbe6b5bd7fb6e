use crate::connection::{Connection, Driver};
use crate::context::Context;
use crate::error::Error;
use crate::retry::{Attempt, Retry};

/// Hands out one long-lived connection to the target database.
///
/// The first [Connector::connect] opens a session through the [Driver] and pings it, both under
/// the [Retry] schedule, so a database that is still starting up is waited for. Later calls
/// return the cached session once it answers a ping, and open a new one otherwise.
#[derive(Debug)]
pub struct Connector {
    driver: Box<dyn Driver>,
    retry: Retry,
    conn: Option<Box<dyn Connection>>,
}

impl Connector {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self::with_retry(driver, Retry::default())
    }

    pub fn with_retry(driver: Box<dyn Driver>, retry: Retry) -> Self {
        Self {
            driver,
            retry,
            conn: None,
        }
    }

    pub fn retry(&self) -> &Retry {
        &self.retry
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connect(&mut self, ctx: &Context) -> Result<&mut dyn Connection, Error> {
        if let Some(conn) = self.conn.as_deref_mut() {
            if let Err(_err) = conn.ping() {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "cached connection is gone, reconnecting");
                self.conn = None;
            }
        }

        if self.conn.is_none() {
            let driver = &self.driver;
            let conn = self
                .retry
                .run(ctx, |attempt| {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, "connecting to database");
                    #[cfg(not(feature = "tracing"))]
                    let _ = attempt;

                    let classify = |err: Error| {
                        if driver.is_retryable(&err) {
                            Attempt::Retry(err)
                        } else {
                            Attempt::Abort(err)
                        }
                    };
                    let mut conn = driver.open().map_err(classify)?;
                    conn.ping().map_err(classify)?;
                    Ok(conn)
                })
                .map_err(|err| match err {
                    Error::ContextEnded(_) | Error::InvalidDatabaseUrl(_) => err,
                    other => Error::ConnectionFailed(Box::new(other)),
                })?;

            #[cfg(feature = "tracing")]
            tracing::debug!("database connection established");
            self.conn = Some(conn);
        }

        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::Generic("connection is not open".to_string())),
        }
    }

    /// Drop the cached connection. The next [Connector::connect] opens a new one.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!("database connection closed");
        }
    }
}
