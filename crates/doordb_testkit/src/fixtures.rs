//! Test fixtures and database helpers.
//!
//! Provides a small sample schema and helpers for opening in-memory nodes
//! with it.

use doordb_core::{
    CoreError, DatabaseConfig, DoorDatabase, EntityRegistry, NodeId, ReplicableEntity, TableId,
    TransactionMode,
};
use doordb_storage::{MemoryDataSource, Row, RowKey};
use serde_json::{json, Value};
use std::sync::Arc;

/// Table id of the sample `Person` entity.
pub const PERSON: TableId = 1;

/// Table id of the sample `Course` entity.
pub const COURSE: TableId = 2;

/// Registry with `Person` (sent first) and `Course`.
pub fn sample_registry() -> EntityRegistry {
    EntityRegistry::new()
        .with(ReplicableEntity::new(PERSON, "Person", "personUid", "etag").with_priority(2))
        .expect("Person registers")
        .with(ReplicableEntity::new(COURSE, "Course", "courseUid", "etag").with_priority(1))
        .expect("Course registers")
}

/// Converts a JSON object literal into a row.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn row(value: Value) -> Row {
    value
        .as_object()
        .cloned()
        .expect("row literal must be a JSON object")
}

/// A `Person` row.
pub fn person_row(pk: i64, etag: i64) -> Row {
    row(json!({"personUid": pk, "etag": etag, "name": format!("person-{pk}")}))
}

/// A `Course` row.
pub fn course_row(pk: i64, etag: i64) -> Row {
    row(json!({"courseUid": pk, "etag": etag, "title": format!("course-{pk}")}))
}

/// Opens a single-writer in-memory node with the sample schema.
///
/// The data source is returned alongside so tests can inspect stored rows.
pub async fn open_memory_node(node_id: NodeId) -> (MemoryDataSource, Arc<DoorDatabase>) {
    open_memory_node_with(MemoryDataSource::single_writer(), node_id).await
}

/// Opens a node with the sample schema over an existing data source.
pub async fn open_memory_node_with(
    source: MemoryDataSource,
    node_id: NodeId,
) -> (MemoryDataSource, Arc<DoorDatabase>) {
    let db = DoorDatabase::open(
        Arc::new(source.clone()),
        sample_registry(),
        DatabaseConfig::new().with_node_id(node_id),
    )
    .await
    .expect("Failed to open in-memory node");
    (source, Arc::new(db))
}

/// Upserts a `Person` row in its own transaction.
pub async fn put_person(db: &DoorDatabase, pk: i64, etag: i64) {
    put_row(db, "Person", person_row(pk, etag)).await;
}

/// Upserts a `Course` row in its own transaction.
pub async fn put_course(db: &DoorDatabase, pk: i64, etag: i64) {
    put_row(db, "Course", course_row(pk, etag)).await;
}

/// Reads a row of the sample schema by primary key.
pub async fn get_row(db: &DoorDatabase, table_id: TableId, pk: i64) -> Option<Row> {
    let table = db
        .registry()
        .require(table_id)
        .expect("sample table")
        .table_name
        .clone();
    let key = RowKey::single(pk);
    db.with_transaction(TransactionMode::ReadOnly, |txn| async move {
        txn.get(&table, key)
    })
    .await
    .expect("Failed to read row")
}

async fn put_row(db: &DoorDatabase, table: &'static str, row: Row) {
    db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
        txn.upsert(table, row)?;
        Ok::<_, CoreError>(())
    })
    .await
    .expect("Failed to write row");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_node_has_the_sample_tables() {
        let (source, db) = open_memory_node(7).await;
        assert_eq!(db.node_id(), 7);
        put_person(&db, 1, 1).await;
        put_course(&db, 2, 1).await;
        assert_eq!(source.row_count("Person"), 1);
        assert_eq!(get_row(&db, COURSE, 2).await.unwrap()["title"], json!("course-2"));
        assert!(get_row(&db, PERSON, 9).await.is_none());
    }
}
