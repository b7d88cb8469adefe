use crate::augment::row::{AugmentedRow, RowOp};
use crate::sink::row_key::{commit_day, delta_row_key};
use serde::{Deserialize, Serialize};

/// All replicated cells live in a single column family.
pub const COLUMN_FAMILY: &str = "d";

/// Qualifier of the per-row operation marker cell.
pub const ROW_STATUS_QUALIFIER: &str = "row_status";

/// A sink-level put: one versioned cell addressed by table, row key,
/// qualifier and the binlog-derived timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: String,
    pub row_key: String,
    pub qualifier: String,
    pub timestamp_micros: u64,
    pub value: String,
}

/// Mutations for one augmented row against its main table.
///
/// Inserts and updates put one cell per carried column plus the
/// `d:row_status` marker; deletes put only the marker so historical cell
/// versions survive. Every mutation shares the row's commit timestamp.
pub fn mutations_for_row(row: &AugmentedRow) -> Vec<Mutation> {
    mutations_against(row, &row.table, &row.row_key)
}

/// The same mutations re-addressed to the day-suffixed delta table, with the
/// commit day prefixed onto the row key.
pub fn delta_mutations_for_row(row: &AugmentedRow) -> Vec<Mutation> {
    let table = delta_table_name(&row.table, row.commit_micros);
    let key = delta_row_key(row.commit_micros, &row.row_key);
    mutations_against(row, &table, &key)
}

pub fn delta_table_name(table: &str, commit_micros: u64) -> String {
    format!("{}_{}", table, commit_day(commit_micros))
}

fn mutations_against(row: &AugmentedRow, table: &str, row_key: &str) -> Vec<Mutation> {
    let mut mutations = Vec::with_capacity(row.cells.len() + 1);

    if row.op != RowOp::Delete {
        for cell in &row.cells {
            let Some(value) = &cell.after else { continue };
            mutations.push(Mutation {
                table: table.to_string(),
                row_key: row_key.to_string(),
                qualifier: cell.column.clone(),
                timestamp_micros: row.commit_micros,
                value: value.clone(),
            });
        }
    }

    mutations.push(Mutation {
        table: table.to_string(),
        row_key: row_key.to_string(),
        qualifier: ROW_STATUS_QUALIFIER.to_string(),
        timestamp_micros: row.commit_micros,
        value: row.op.marker().to_string(),
    });

    mutations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::row::CellChange;

    fn insert_row() -> AugmentedRow {
        AugmentedRow {
            table: "t1".to_string(),
            op: RowOp::Insert,
            commit_micros: 1_448_496_010_000_001,
            row_key: "7".to_string(),
            cells: vec![CellChange {
                column: "a".to_string(),
                before: None,
                after: Some("1".to_string()),
            }],
        }
    }

    #[test]
    fn insert_puts_cells_and_status_marker() {
        let mutations = mutations_for_row(&insert_row());
        assert_eq!(mutations.len(), 2);
        assert_eq!(mutations[0].qualifier, "a");
        assert_eq!(mutations[0].value, "1");
        assert_eq!(mutations[1].qualifier, ROW_STATUS_QUALIFIER);
        assert_eq!(mutations[1].value, "I");
        assert!(mutations
            .iter()
            .all(|m| m.timestamp_micros == 1_448_496_010_000_001));
    }

    #[test]
    fn delete_puts_only_the_status_marker() {
        let mut row = insert_row();
        row.op = RowOp::Delete;
        row.cells = vec![CellChange {
            column: "a".to_string(),
            before: Some("1".to_string()),
            after: None,
        }];
        let mutations = mutations_for_row(&row);
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].qualifier, ROW_STATUS_QUALIFIER);
        assert_eq!(mutations[0].value, "D");
    }

    #[test]
    fn delta_mutations_target_the_day_suffixed_table() {
        let mutations = delta_mutations_for_row(&insert_row());
        assert!(mutations.iter().all(|m| m.table == "t1_20151126"));
        assert!(mutations.iter().all(|m| m.row_key == "20151126\u{1F}7"));
    }
}
