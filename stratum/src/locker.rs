//! Advisory locking between migrators running against the same database.

use crate::connection::Connection;
use crate::context::Context;
use crate::error::Error;
use std::fmt;

/// A database-level advisory lock.
///
/// `lock` returns once the session holds the lock. Unlocking a lock that is not held is an error
/// on some backends and a no-op on others, so callers must not rely on either.
pub trait Locker: Send + Sync + fmt::Debug {
    fn lock(&self, ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error>;

    fn unlock(&self, ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error>;
}

/// Locks nothing. Used by single-writer backends and when locking is turned off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLocker;

impl Locker for NullLocker {
    fn lock(&self, _ctx: &Context, _conn: &mut dyn Connection) -> Result<(), Error> {
        Ok(())
    }

    fn unlock(&self, _ctx: &Context, _conn: &mut dyn Connection) -> Result<(), Error> {
        Ok(())
    }
}

/// Holds the advisory lock for as long as it lives.
///
/// [LockGuard::release] reports unlock failures; dropping the guard without releasing (an early
/// return or a panic) still unlocks, logging any failure.
pub struct LockGuard<'a> {
    ctx: &'a Context,
    locker: &'a dyn Locker,
    conn: &'a mut dyn Connection,
    held: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(
        ctx: &'a Context,
        locker: &'a dyn Locker,
        conn: &'a mut dyn Connection,
    ) -> Result<Self, Error> {
        ctx.check()
            .and_then(|()| locker.lock(ctx, &mut *conn))
            .map_err(|err| Error::LockAcquisitionFailed(Box::new(err)))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(?locker, "migration lock acquired");

        Ok(Self {
            ctx,
            locker,
            conn,
            held: true,
        })
    }

    /// The session holding the lock.
    pub fn conn(&mut self) -> &mut dyn Connection {
        &mut *self.conn
    }

    /// Unlock now. Runs even when the context has ended, since the lock outlives the operation.
    pub fn release(mut self) -> Result<(), Error> {
        self.held = false;
        self.locker
            .unlock(self.ctx, &mut *self.conn)
            .map_err(|err| Error::LockReleaseFailed(Box::new(err)))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(locker = ?self.locker, "migration lock released");
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(_err) = self.locker.unlock(self.ctx, &mut *self.conn) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to release migration lock");
        }
    }
}
