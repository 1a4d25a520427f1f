//! LanceDB vector database storage implementation.
//!
//! This module provides integration with LanceDB for embedded, in-process vector storage.

use super::store::{source_matches, VectorStore};
use super::types::{Document, SearchResult, CHUNK_KEY, SOURCE_KEY};
use crate::config::{Distance, StorageConfig};
use anyhow::{bail, Context, Result};
use arrow_array::{
    array::{ArrayRef, FixedSizeListArray, Float32Array, Int64Array, StringArray},
    Array, RecordBatch, RecordBatchIterator,
};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use lancedb::arrow::arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, DistanceType, Table};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// LanceDB-based vector store for embedded deployment.
///
/// Provides zero-setup, in-process vector storage using LanceDB.
pub struct LanceDbStore {
    table: Table,
    vector_size: usize,
    distance: Distance,
}

#[async_trait]
impl VectorStore for LanceDbStore {
    async fn upsert(&self, documents: Vec<Document>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let batch = self.to_record_batch(&documents)?;
        let schema_ref = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema_ref);

        let mut merge = self.table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .context("Failed to upsert documents into LanceDB")?;

        debug!(count = documents.len(), table = %self.table.name(), "Upserted documents");
        Ok(())
    }

    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        if query_embedding.len() != self.vector_size {
            bail!(
                "Query dimension {} does not match table dimension {}",
                query_embedding.len(),
                self.vector_size
            );
        }

        let results = self
            .table
            .query()
            .nearest_to(query_embedding)?
            .distance_type(lance_distance(self.distance))
            .limit(top_k)
            .execute()
            .await
            .context("Failed to execute LanceDB query")?;

        let batches: Vec<RecordBatch> = results
            .try_collect()
            .await
            .context("Failed to collect query results")?;

        let mut search_results = Vec::new();

        for batch in batches {
            let id_array = string_column(&batch, "id")?;
            let content_array = string_column(&batch, "content")?;
            let source_array = string_column(&batch, SOURCE_KEY)?;
            let chunk_array = int_column(&batch, CHUNK_KEY)?;
            let distance_array = batch
                .column_by_name("_distance")
                .context("Missing '_distance' column")?
                .as_any()
                .downcast_ref::<Float32Array>()
                .context("Failed to cast '_distance' to Float32Array")?;

            for i in 0..batch.num_rows() {
                let mut metadata = HashMap::new();
                if !source_array.is_null(i) {
                    metadata.insert(SOURCE_KEY.to_string(), source_array.value(i).to_string());
                }
                if !chunk_array.is_null(i) {
                    metadata.insert(CHUNK_KEY.to_string(), chunk_array.value(i).to_string());
                }

                let document = Document {
                    id: id_array.value(i).to_string(),
                    content: content_array.value(i).to_string(),
                    embedding: vec![],
                    metadata,
                };

                search_results.push(SearchResult {
                    document,
                    score: self.score(distance_array.value(i)),
                });
            }
        }

        search_results.sort_by(|a, b| b.score.total_cmp(&a.score));
        search_results.truncate(top_k);
        Ok(search_results)
    }

    async fn count(&self) -> Result<usize> {
        let count = self.table.count_rows(None).await?;
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        self.table
            .delete("true")
            .await
            .context("Failed to clear LanceDB table")?;
        Ok(())
    }

    async fn get_indexed_paths(&self) -> Result<Vec<String>> {
        let batches = self.scan_all().await?;

        let mut unique_paths = BTreeSet::new();
        for batch in batches {
            let source_array = string_column(&batch, SOURCE_KEY)?;
            for i in 0..batch.num_rows() {
                if !source_array.is_null(i) {
                    unique_paths.insert(source_array.value(i).to_string());
                }
            }
        }

        Ok(unique_paths.into_iter().collect())
    }

    async fn remove_by_source(&self, source_path: &str) -> Result<usize> {
        let batches = self.scan_all().await?;

        let mut ids_to_delete = Vec::new();
        for batch in batches {
            let id_array = string_column(&batch, "id")?;
            let source_array = string_column(&batch, SOURCE_KEY)?;
            for i in 0..batch.num_rows() {
                if !source_array.is_null(i) && source_matches(source_array.value(i), source_path) {
                    ids_to_delete.push(quote(id_array.value(i)));
                }
            }
        }

        let count = ids_to_delete.len();
        if count > 0 {
            let delete_expr = format!("id IN ({})", ids_to_delete.join(", "));
            self.table
                .delete(&delete_expr)
                .await
                .context("Failed to delete documents by source")?;
        }

        Ok(count)
    }

    async fn remove_stale(&self, source: &str, keep_below: usize) -> Result<usize> {
        let predicate = format!("{SOURCE_KEY} = {} AND {CHUNK_KEY} >= {keep_below}", quote(source));
        let stale = self
            .table
            .count_rows(Some(predicate.clone()))
            .await
            .context("Failed to count stale chunks")?;

        if stale > 0 {
            self.table
                .delete(&predicate)
                .await
                .context("Failed to delete stale chunks")?;
            debug!(source, removed = stale, "Removed stale chunks");
        }

        Ok(stale)
    }
}

impl LanceDbStore {
    fn create_schema(vector_size: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_size as i32,
                ),
                false,
            ),
            Field::new(SOURCE_KEY, DataType::Utf8, true),
            Field::new(CHUNK_KEY, DataType::Int64, true),
        ]))
    }

    /// Opens the configured table under `working_dir/vectors`, creating it when missing.
    ///
    /// # Arguments
    ///
    /// * `config` - Storage configuration (path, table name, distance metric)
    /// * `vector_size` - Dimension of the embedding vectors
    ///
    /// # Errors
    ///
    /// Fails when an existing table was created with a different dimension.
    pub async fn new(config: &StorageConfig, vector_size: usize) -> Result<Self> {
        let path = config.vectors_path();
        let uri = path.to_string_lossy();
        let conn = connect(&uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let table_names = conn.table_names().execute().await?;
        let collection_name = config.collection_name.as_str();

        let table = if table_names.iter().any(|name| name == collection_name) {
            let table = conn
                .open_table(collection_name)
                .execute()
                .await
                .context("Failed to open LanceDB table")?;
            check_vector_size(&table, vector_size).await?;
            table
        } else {
            let schema = Self::create_schema(vector_size);
            conn.create_empty_table(collection_name, schema)
                .execute()
                .await
                .context("Failed to create LanceDB table")?
        };

        debug!(path = %uri, table = collection_name, dim = vector_size, "Opened LanceDB table");

        Ok(Self {
            table,
            vector_size,
            distance: config.distance,
        })
    }

    fn to_record_batch(&self, documents: &[Document]) -> Result<RecordBatch> {
        let mut values = Vec::with_capacity(documents.len() * self.vector_size);
        for document in documents {
            if document.embedding.len() != self.vector_size {
                bail!(
                    "Document '{}' has dimension {}, table expects {}",
                    document.id,
                    document.embedding.len(),
                    self.vector_size
                );
            }
            values.extend_from_slice(&document.embedding);
        }

        let id_array = StringArray::from(documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>());
        let content_array =
            StringArray::from(documents.iter().map(|d| d.content.as_str()).collect::<Vec<_>>());
        let source_array = StringArray::from(documents.iter().map(|d| d.source()).collect::<Vec<_>>());
        let chunk_array = Int64Array::from(
            documents
                .iter()
                .map(|d| d.chunk_index().map(|i| i as i64))
                .collect::<Vec<_>>(),
        );
        let vector_array = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.vector_size as i32,
            Arc::new(Float32Array::from(values)),
            None,
        )
        .context("Failed to build vector column")?;

        RecordBatch::try_new(
            Self::create_schema(self.vector_size),
            vec![
                Arc::new(id_array) as ArrayRef,
                Arc::new(content_array) as ArrayRef,
                Arc::new(vector_array) as ArrayRef,
                Arc::new(source_array) as ArrayRef,
                Arc::new(chunk_array) as ArrayRef,
            ],
        )
        .context("Failed to create record batch")
    }

    async fn scan_all(&self) -> Result<Vec<RecordBatch>> {
        let results = self
            .table
            .query()
            .execute()
            .await
            .context("Failed to query all documents")?;
        results
            .try_collect()
            .await
            .context("Failed to collect query results")
    }

    fn score(&self, distance: f32) -> f32 {
        match self.distance {
            Distance::Cosine | Distance::Dot => 1.0 - distance,
            Distance::L2 => -distance,
        }
    }
}

fn lance_distance(distance: Distance) -> DistanceType {
    match distance {
        Distance::Cosine => DistanceType::Cosine,
        Distance::Dot => DistanceType::Dot,
        Distance::L2 => DistanceType::L2,
    }
}

async fn check_vector_size(table: &Table, expected: usize) -> Result<()> {
    let schema = table.schema().await.context("Failed to read table schema")?;
    let field = schema
        .field_with_name("vector")
        .context("Table has no 'vector' column")?;
    if let DataType::FixedSizeList(_, size) = field.data_type() {
        if *size as usize != expected {
            bail!(
                "Table '{}' stores {}-dimensional vectors but the embedding model produces {}",
                table.name(),
                size,
                expected
            );
        }
    }
    Ok(())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing '{name}' column"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("Failed to cast '{name}' to StringArray"))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing '{name}' column"))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("Failed to cast '{name}' to Int64Array"))
}

/// SQL string literal with embedded quotes doubled.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
