use std::path::Path;

use redb::{Database, ReadTransaction, TableDefinition, WriteTransaction};

use crate::Result;

/// Allocation records live in a single table: key is the textual IP as a
/// JSON string, value is the owning service identity as JSON.
pub(crate) const IP_ALLOC: TableDefinition<&str, &str> = TableDefinition::new("ip-alloc");

/// Thin facade over the embedded database. Callers get a read-only snapshot
/// through [`Store::view`] or a serializable read-write transaction through
/// [`Store::update`]; transactions never span I/O to anything else.
pub struct Store {
    db: Database,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        // Make sure the table exists so later read transactions can open it.
        let txn = db.begin_write()?;
        txn.open_table(IP_ALLOC)?;
        txn.commit()?;
        Ok(Self { db })
    }

    pub fn view<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    /// Commits when the closure succeeds, rolls back when it errors.
    pub fn update<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_write()?;
        match f(&txn) {
            Ok(v) => {
                txn.commit()?;
                Ok(v)
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }
}
