use crate::error::PipelineError;
use crate::position::FakeMicrosecondsCounter;
use crate::schema::{SchemaCache, SchemaError, TableSchema};
use model::augment::row::{AugmentedRow, AugmentedRowsEvent, CellChange, RowOp};
use model::binlog::event::{RowImage, RowsEvent, RowsEventKind};
use model::binlog::position::commit_micros;
use model::core::codec::encode_cell;
use model::core::value::Value;
use model::sink::row_key;
use replicator_core::error::InvariantViolation;

/// Joins raw row events with cached schema to produce augmented rows:
/// column names attached, values run through the type coder, update images
/// reduced to their changed cells, and a commit timestamp derived from the
/// event second plus the fake-microseconds counter (one increment per row).
pub struct Augmenter {
    cache: SchemaCache,
}

impl Augmenter {
    pub fn new(cache: SchemaCache) -> Self {
        Self { cache }
    }

    pub fn schema_cache_mut(&mut self) -> &mut SchemaCache {
        &mut self.cache
    }

    pub async fn augment(
        &mut self,
        event: &RowsEvent,
        counter: &FakeMicrosecondsCounter,
    ) -> Result<AugmentedRowsEvent, PipelineError> {
        let table_schema = self
            .cache
            .get(&event.schema, &event.table)
            .await
            .map_err(|source| PipelineError::SchemaMiss {
                schema: event.schema.clone(),
                table: event.table.clone(),
                source,
            })?;

        let mut augmented = AugmentedRowsEvent::default();
        for image in &event.rows {
            let micros = commit_micros(event.header.timestamp, counter.next());
            augmented.push(augment_row(&table_schema, event.kind, image, micros)?);
        }
        Ok(augmented)
    }
}

fn malformed_image(kind: RowsEventKind, table: &str) -> PipelineError {
    InvariantViolation(format!("{kind:?} row event for '{table}' is missing its row image")).into()
}

fn augment_row(
    schema: &TableSchema,
    kind: RowsEventKind,
    image: &RowImage,
    micros: u64,
) -> Result<AugmentedRow, PipelineError> {
    let before = encode_image(schema, image.before.as_deref())?;
    let after = encode_image(schema, image.after.as_deref())?;

    let (op, cells) = match kind {
        RowsEventKind::Write => {
            let after = after.ok_or_else(|| malformed_image(kind, &schema.table))?;
            let cells = schema
                .columns
                .iter()
                .zip(after.iter())
                .map(|(column, value)| CellChange {
                    column: column.name.clone(),
                    before: None,
                    after: Some(value.clone()),
                })
                .collect();
            (RowOp::Insert, cells)
        }
        RowsEventKind::Update => {
            let before = before.ok_or_else(|| malformed_image(kind, &schema.table))?;
            let after = after.ok_or_else(|| malformed_image(kind, &schema.table))?;
            // Only cells whose encoded value actually changed are carried.
            let cells = schema
                .columns
                .iter()
                .zip(before.iter().zip(after.iter()))
                .filter(|(_, (old, new))| old != new)
                .map(|(column, (old, new))| CellChange {
                    column: column.name.clone(),
                    before: Some(old.clone()),
                    after: Some(new.clone()),
                })
                .collect();
            (RowOp::Update, cells)
        }
        RowsEventKind::Delete => {
            let before = before.ok_or_else(|| malformed_image(kind, &schema.table))?;
            let cells = schema
                .columns
                .iter()
                .zip(before.iter())
                .map(|(column, value)| CellChange {
                    column: column.name.clone(),
                    before: Some(value.clone()),
                    after: None,
                })
                .collect();
            (RowOp::Delete, cells)
        }
    };

    // The key comes from the image that carries this row's identity: the
    // prior image for deletes, the resulting image otherwise.
    let key_image = match kind {
        RowsEventKind::Delete => image.before.as_deref(),
        _ => image.after.as_deref(),
    };
    let key_image = key_image.ok_or_else(|| malformed_image(kind, &schema.table))?;
    let key = build_row_key(schema, key_image)?;

    Ok(AugmentedRow {
        table: schema.table.clone(),
        op,
        commit_micros: micros,
        row_key: key,
        cells,
    })
}

fn encode_image(
    schema: &TableSchema,
    values: Option<&[Value]>,
) -> Result<Option<Vec<String>>, PipelineError> {
    let Some(values) = values else {
        return Ok(None);
    };
    if values.len() != schema.columns.len() {
        return Err(PipelineError::SchemaMiss {
            schema: schema.schema.clone(),
            table: schema.table.clone(),
            source: SchemaError::ColumnCountMismatch {
                schema: schema.schema.clone(),
                table: schema.table.clone(),
                columns: schema.columns.len(),
                values: values.len(),
            },
        });
    }
    let mut encoded = Vec::with_capacity(values.len());
    for (column, value) in schema.columns.iter().zip(values) {
        encoded.push(encode_cell(column, value)?);
    }
    Ok(Some(encoded))
}

/// Primary-key fingerprint of the row. Tables without a primary key fall
/// back to the full column list, which keeps the key stable under RBR.
fn build_row_key(schema: &TableSchema, values: &[Value]) -> Result<String, PipelineError> {
    let positions: Vec<usize> = if schema.primary_key.is_empty() {
        (0..schema.columns.len()).collect()
    } else {
        schema.primary_key.clone()
    };
    let mut parts = Vec::with_capacity(positions.len());
    for position in positions {
        let column = &schema.columns[position];
        let value = &values[position];
        parts.push(encode_cell(column, value)?);
    }
    Ok(row_key::row_key(&parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FixedActiveSchema;
    use model::binlog::event::EventHeader;
    use model::core::column::{ColumnSchema, SqlType};
    use std::sync::Arc;

    fn t1() -> TableSchema {
        TableSchema {
            schema: "shop".to_string(),
            table: "t1".to_string(),
            columns: vec![
                ColumnSchema::new("id", SqlType::Integer),
                ColumnSchema::new("a", SqlType::Integer),
                ColumnSchema::new("b", SqlType::Integer),
            ],
            primary_key: vec![0],
        }
    }

    fn augmenter() -> Augmenter {
        let active = FixedActiveSchema::new().with_table(t1());
        Augmenter::new(SchemaCache::new(Arc::new(active)))
    }

    fn rows_event(kind: RowsEventKind, rows: Vec<RowImage>) -> RowsEvent {
        RowsEvent {
            header: EventHeader {
                timestamp: 100,
                next_position: 500,
            },
            schema: "shop".to_string(),
            table: "t1".to_string(),
            kind,
            rows,
        }
    }

    fn int_row(id: i64, a: i64, b: i64) -> Vec<Value> {
        vec![Value::SignedInt(id), Value::SignedInt(a), Value::SignedInt(b)]
    }

    #[tokio::test]
    async fn insert_rows_carry_all_columns_and_sequential_timestamps() {
        let mut augmenter = augmenter();
        let counter = FakeMicrosecondsCounter::new();
        let event = rows_event(
            RowsEventKind::Write,
            vec![
                RowImage::write(int_row(7, 1, 5)),
                RowImage::write(int_row(8, 2, 6)),
            ],
        );

        let augmented = augmenter.augment(&event, &counter).await.unwrap();
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented.rows[0].commit_micros, 100_000_001);
        assert_eq!(augmented.rows[1].commit_micros, 100_000_002);
        assert_eq!(augmented.rows[0].row_key, "7");
        assert_eq!(augmented.rows[0].cells.len(), 3);
        assert_eq!(augmented.rows[0].op, RowOp::Insert);
    }

    #[tokio::test]
    async fn updates_carry_only_changed_cells() {
        let mut augmenter = augmenter();
        let counter = FakeMicrosecondsCounter::new();
        let event = rows_event(
            RowsEventKind::Update,
            vec![RowImage::update(int_row(7, 1, 5), int_row(7, 2, 5))],
        );

        let augmented = augmenter.augment(&event, &counter).await.unwrap();
        let row = &augmented.rows[0];
        assert_eq!(row.op, RowOp::Update);
        assert_eq!(row.cells.len(), 1);
        assert_eq!(row.cells[0].column, "a");
        assert_eq!(row.cells[0].before.as_deref(), Some("1"));
        assert_eq!(row.cells[0].after.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn deletes_key_off_the_before_image() {
        let mut augmenter = augmenter();
        let counter = FakeMicrosecondsCounter::new();
        let event = rows_event(
            RowsEventKind::Delete,
            vec![RowImage::delete(int_row(7, 1, 5))],
        );

        let augmented = augmenter.augment(&event, &counter).await.unwrap();
        let row = &augmented.rows[0];
        assert_eq!(row.op, RowOp::Delete);
        assert_eq!(row.row_key, "7");
        assert!(row.cells.iter().all(|c| c.after.is_none()));
    }

    #[tokio::test]
    async fn column_count_mismatch_is_rejected() {
        let mut augmenter = augmenter();
        let counter = FakeMicrosecondsCounter::new();
        let event = rows_event(
            RowsEventKind::Write,
            vec![RowImage::write(vec![Value::SignedInt(7)])],
        );
        let err = augmenter.augment(&event, &counter).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMiss { .. }));
    }
}
