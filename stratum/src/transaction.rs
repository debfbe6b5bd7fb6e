use crate::connection::{Connection, Row};
use crate::context::Context;
use crate::dialect::{Dialect, Query};
use crate::error::Error;

/// An open transaction on a [Connection].
///
/// Rolled back on drop unless [Transaction::commit] or [Transaction::rollback] was called, so an
/// early return or a panic never leaves it open.
pub struct Transaction<'a> {
    ctx: &'a Context,
    dialect: &'a dyn Dialect,
    conn: &'a mut dyn Connection,
    open: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(
        ctx: &'a Context,
        dialect: &'a dyn Dialect,
        conn: &'a mut dyn Connection,
        read_only: bool,
    ) -> Result<Self, Error> {
        ctx.check()
            .and_then(|()| conn.batch_execute(dialect.begin_statement(read_only)))
            .map_err(|err| Error::TransactionBeginFailed(Box::new(err)))?;
        Ok(Self {
            ctx,
            dialect,
            conn,
            open: true,
        })
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect
    }

    pub fn execute(&mut self, query: &Query) -> Result<u64, Error> {
        self.ctx.check()?;
        self.conn.execute(&query.sql, &query.params)
    }

    pub fn query(&mut self, query: &Query) -> Result<Vec<Row>, Error> {
        self.ctx.check()?;
        self.conn.query(&query.sql, &query.params)
    }

    /// Run a user script, which may hold several statements.
    pub fn batch_execute(&mut self, script: &str) -> Result<(), Error> {
        self.ctx.check()?;
        self.conn.batch_execute(script)
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.open = false;
        let (ctx, dialect) = (self.ctx, self.dialect);
        match ctx
            .check()
            .and_then(|()| self.conn.batch_execute(dialect.commit_statement()))
        {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = Error::TransactionCommitFailed(Box::new(err));
                match self.conn.batch_execute(dialect.rollback_statement()) {
                    Ok(()) => Err(err),
                    Err(rollback) => {
                        Err(err.suppress(Error::TransactionRollbackFailed(Box::new(rollback))))
                    }
                }
            }
        }
    }

    /// Roll back explicitly. Runs even when the context has ended, since it releases server state.
    pub fn rollback(mut self) -> Result<(), Error> {
        self.open = false;
        self.conn
            .batch_execute(self.dialect.rollback_statement())
            .map_err(|err| Error::TransactionRollbackFailed(Box::new(err)))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(_err) = self.conn.batch_execute(self.dialect.rollback_statement()) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to roll back abandoned transaction");
        }
    }
}
