//! # Table Statistics
//!
//! The store maintains approximate per-table statistics (entity count and
//! size). They are refreshed by the store on its own schedule, typically once
//! a day, so counts read here can lag behind reality.
//!
//! Tables whose names start with `_` belong to the store and are hidden from
//! [`CloudStore::get_tables`].

use crate::api::CloudStore;
use crate::error::Result;
use crate::remote::TableStats;
use crate::types::TableName;

impl CloudStore {
    /// Statistics for every table, including internal ones.
    pub async fn get_all_stats(&self) -> Result<Vec<TableStats>> {
        let remote = self.remote();
        self.retry_remote("getAllStats", || remote.table_stats(None))
            .await
    }

    /// Statistics for one table, if the store has computed any.
    pub async fn get_stats(&self, table: impl Into<TableName>) -> Result<Option<TableStats>> {
        let table = table.into();
        let remote = self.remote();
        let table_ref = &table;
        let stats = self
            .retry_remote("getStats", move || remote.table_stats(Some(table_ref)))
            .await?;
        Ok(stats.into_iter().find(|s| s.table == table))
    }

    /// Approximate row count of one table.
    pub async fn get_stats_count(&self, table: impl Into<TableName>) -> Result<Option<u64>> {
        Ok(self.get_stats(table).await?.map(|s| s.count))
    }

    /// Names of the application's tables, sorted.
    pub async fn get_tables(&self) -> Result<Vec<TableName>> {
        let mut tables: Vec<TableName> = self
            .get_all_stats()
            .await?
            .into_iter()
            .map(|s| s.table)
            .filter(|t| !t.is_internal())
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    /// Checks connectivity with one statistics call.
    pub async fn ping(&self) -> Result<()> {
        self.get_all_stats().await.map(|_| ())
    }
}
