use model::sink::mutation::Mutation;
use std::collections::HashMap;
use uuid::Uuid;

/// Task lifecycle. A task is born READY_FOR_BUFFERING, becomes
/// READY_FOR_PICK_UP on buffer cut-over, then SUBMITTED → IN_PROGRESS →
/// SUCCEEDED or FAILED. A failed task reverts to READY_FOR_PICK_UP with its
/// buffers intact; a succeeded one is removed from every map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    ReadyForBuffering,
    ReadyForPickUp,
    TaskSubmitted,
    WriteInProgress,
    WriteSucceeded,
    WriteFailed,
}

/// A transaction is OPEN until its commit is demarcated, and never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    ReadyForCommit,
}

/// Ordered mutations of one table within one transaction. `row_keys` holds
/// one entry per buffered row (not per cell) and is retained for reporting
/// and per-table stats.
#[derive(Debug, Clone)]
pub struct TableBatch {
    pub table: String,
    pub mutations: Vec<Mutation>,
    pub row_keys: Vec<String>,
}

impl TableBatch {
    fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            mutations: Vec::new(),
            row_keys: Vec::new(),
        }
    }
}

/// One source transaction inside a task. The same transaction id reappears
/// in the follow-up task when a transaction outlives a task's row budget.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub status: TransactionStatus,
    /// XID of the source commit, once known, for traceability.
    pub xid: Option<u64>,
    pub tables: Vec<TableBatch>,
}

impl Transaction {
    pub fn open(id: Uuid) -> Self {
        Self {
            id,
            status: TransactionStatus::Open,
            xid: None,
            tables: Vec::new(),
        }
    }

    pub fn batch_mut(&mut self, table: &str) -> &mut TableBatch {
        if let Some(index) = self.tables.iter().position(|b| b.table == table) {
            return &mut self.tables[index];
        }
        self.tables.push(TableBatch::new(table));
        self.tables.last_mut().unwrap()
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|b| b.row_keys.len()).sum()
    }
}

/// Unit of concurrent flush, tagged by UUID. Holds the transactions buffered
/// into it, in arrival order, plus the error messages reported during flush.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub transactions: Vec<Transaction>,
    pub messages: Vec<String>,
}

impl Task {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: TaskStatus::ReadyForBuffering,
            transactions: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn transaction_mut(&mut self, id: Uuid) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.id == id)
    }

    pub fn open_transaction_ids(&self) -> Vec<Uuid> {
        self.transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Open)
            .map(|t| t.id)
            .collect()
    }

    pub fn has_rows(&self) -> bool {
        self.row_count() > 0
    }

    pub fn row_count(&self) -> usize {
        self.transactions.iter().map(|t| t.row_count()).sum()
    }

    /// Rows per table across all transactions, computed off the row-key
    /// buffer the way the flush job reports stats.
    pub fn per_table_row_counts(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for transaction in &self.transactions {
            for batch in &transaction.tables {
                *counts.entry(batch.table.clone()).or_insert(0) += batch.row_keys.len() as u64;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(table: &str, row_key: &str, qualifier: &str) -> Mutation {
        Mutation {
            table: table.to_string(),
            row_key: row_key.to_string(),
            qualifier: qualifier.to_string(),
            timestamp_micros: 1,
            value: "v".to_string(),
        }
    }

    #[test]
    fn batches_are_created_lazily_and_reused() {
        let mut transaction = Transaction::open(Uuid::new_v4());
        transaction.batch_mut("t1").mutations.push(mutation("t1", "k", "a"));
        transaction.batch_mut("t1").row_keys.push("k".to_string());
        transaction.batch_mut("t1").mutations.push(mutation("t1", "k2", "a"));
        transaction.batch_mut("t1").row_keys.push("k2".to_string());
        assert_eq!(transaction.tables.len(), 1);
        assert_eq!(transaction.row_count(), 2);
    }

    #[test]
    fn row_counts_walk_the_row_key_buffer() {
        let mut task = Task::new(Uuid::new_v4());
        let txn_id = Uuid::new_v4();
        task.transactions.push(Transaction::open(txn_id));
        let transaction = task.transaction_mut(txn_id).unwrap();
        for key in ["1", "2", "3"] {
            let batch = transaction.batch_mut("t1");
            // Two cells, one row.
            batch.mutations.push(mutation("t1", key, "a"));
            batch.mutations.push(mutation("t1", key, "row_status"));
            batch.row_keys.push(key.to_string());
        }
        assert_eq!(task.row_count(), 3);
        assert_eq!(task.per_table_row_counts()["t1"], 3);
        assert!(task.has_rows());
    }

    #[test]
    fn open_transactions_are_reported_by_id() {
        let mut task = Task::new(Uuid::new_v4());
        let open = Uuid::new_v4();
        let committed = Uuid::new_v4();
        task.transactions.push(Transaction::open(open));
        let mut done = Transaction::open(committed);
        done.status = TransactionStatus::ReadyForCommit;
        task.transactions.push(done);
        assert_eq!(task.open_transaction_ids(), vec![open]);
    }
}
