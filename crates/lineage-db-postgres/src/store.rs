//! PostgreSQL implementation of the PathIndexStore and ViewStore traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgConnection, PgPool};
use time::OffsetDateTime;

use lineage_storage::{
    Entity, EntityId, EntityPath, JoinColumn, MaterializedAnswer, MutationKind, MutationOutcome,
    NewEntity, PathIndexStore, SourceHash, StorageError, ViewStore, normalize_confidence,
};

use crate::config::PostgresConfig;
use crate::error::{PG_UNDEFINED_COLUMN, has_pg_error_code, is_unique_violation, map_sqlx_error};
use crate::migrations;
use crate::pool::{self, PoolStats};

const ENTITY_COLUMNS: &str = "entity_id, name, entity_type, path, depth, content_hash, \
                              confidence, active, revision, created_at, updated_at";

type EntityRow = (
    String,
    String,
    String,
    String,
    i32,
    String,
    Option<f64>,
    bool,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

type JoinedRow = (String, Vec<String>, i64, DateTime<Utc>, i64, String, i64);

type AnswerRow = (String, String, Vec<String>, i64, DateTime<Utc>, i64);

/// Converts chrono DateTime to time OffsetDateTime.
fn chrono_to_time(dt: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(dt.timestamp()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(i64::from(dt.timestamp_subsec_nanos()))
}

fn time_to_chrono(ts: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), ts.nanosecond()).unwrap_or_default()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn stored_path(raw: &str) -> Result<EntityPath, StorageError> {
    EntityPath::parse(raw)
        .map_err(|e| StorageError::internal(format!("corrupt path '{raw}' in entities: {e}")))
}

fn entity_from_row(row: EntityRow) -> Result<Entity, StorageError> {
    let (id, name, entity_type, path, depth, content_hash, confidence, active, revision, c, u) =
        row;
    Ok(Entity {
        id: EntityId::new(id),
        name,
        entity_type,
        path: stored_path(&path)?,
        depth: u32::try_from(depth).unwrap_or_default(),
        content_hash,
        confidence,
        active,
        revision: to_u64(revision),
        created_at: chrono_to_time(c),
        updated_at: chrono_to_time(u),
    })
}

fn answer_from_row(row: AnswerRow) -> Result<MaterializedAnswer, StorageError> {
    let (entity_id, path, ancestors, descendant_count, computed_at, source_hash) = row;
    Ok(MaterializedAnswer {
        entity_id: EntityId::new(entity_id),
        path: stored_path(&path)?,
        ancestors,
        descendant_count: to_u64(descendant_count),
        computed_at: chrono_to_time(computed_at),
        source_hash: SourceHash(to_u64(source_hash)),
    })
}

fn path_strings(paths: &[EntityPath]) -> Vec<String> {
    paths.iter().map(|p| p.as_str().to_string()).collect()
}

/// Claims the next global revision. Holds the revision row lock until the
/// transaction ends, which serializes writers.
async fn next_revision(conn: &mut PgConnection) -> Result<i64, StorageError> {
    query_scalar("UPDATE lineage_revision SET value = value + 1 WHERE id = 1 RETURNING value")
        .fetch_one(conn)
        .await
        .map_err(|e| map_sqlx_error(e, "next_revision"))
}

async fn lock_active(conn: &mut PgConnection, id: &EntityId) -> Result<Entity, StorageError> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1 AND active FOR UPDATE"
    );
    let row: Option<EntityRow> = query_as(&sql)
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error(e, "lock_active"))?;
    row.map(entity_from_row)
        .transpose()?
        .ok_or_else(|| StorageError::not_found(id.as_str()))
}

async fn path_is_active(conn: &mut PgConnection, path: &EntityPath) -> Result<bool, StorageError> {
    query_scalar("SELECT EXISTS (SELECT 1 FROM entities WHERE path = $1 AND active)")
        .bind(path.as_str())
        .fetch_one(conn)
        .await
        .map_err(|e| map_sqlx_error(e, "path_is_active"))
}

async fn touch_paths(
    conn: &mut PgConnection,
    paths: &[EntityPath],
    revision: i64,
) -> Result<(), StorageError> {
    if paths.is_empty() {
        return Ok(());
    }
    query(
        "UPDATE entities SET revision = $1, updated_at = now() \
         WHERE active AND path = ANY($2)",
    )
    .bind(revision)
    .bind(path_strings(paths))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error(e, "touch_ancestors"))?;
    Ok(())
}

async fn touch_descendants(
    conn: &mut PgConnection,
    prefix: &EntityPath,
    revision: i64,
) -> Result<(), StorageError> {
    query(
        "UPDATE entities SET revision = $1, updated_at = now() \
         WHERE active AND path LIKE $2",
    )
    .bind(revision)
    .bind(prefix.descendant_like_pattern())
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error(e, "touch_descendants"))?;
    Ok(())
}

/// PostgreSQL storage backend for the entity hierarchy.
///
/// Entities and materialized answers live in two tables joined on the
/// configured [`JoinColumn`]. Every write runs in one transaction that also
/// claims the next global revision.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    join_column: JoinColumn,
}

impl PostgresStore {
    /// Creates a pool, runs migrations if configured, and returns the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection pool cannot be created
    /// or if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let pool = pool::create_pool(&config).await?;

        if config.run_migrations {
            migrations::run(&pool).await?;
        }

        Ok(Self::from_pool(pool, config.join_column))
    }

    /// Creates a store from an existing connection pool.
    ///
    /// Migrations are not run automatically when using this constructor.
    #[must_use]
    pub fn from_pool(pool: PgPool, join_column: JoinColumn) -> Self {
        Self { pool, join_column }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats::sample(&self.pool)
    }

    async fn fetch_entity(&self, sql: &str, key: &str) -> Result<Option<Entity>, StorageError> {
        let row: Option<EntityRow> = query_as(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "fetch_entity"))?;
        row.map(entity_from_row).transpose()
    }

    async fn answer_row_exists(&self, id: &EntityId) -> Result<bool, StorageError> {
        query_scalar("SELECT EXISTS (SELECT 1 FROM materialized_answers WHERE entity_id = $1)")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "answer_row_exists"))
    }
}

#[async_trait]
impl PathIndexStore for PostgresStore {
    async fn get_by_id(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1 AND active");
        self.fetch_entity(&sql, id.as_str()).await
    }

    async fn get_by_path(&self, path: &EntityPath) -> Result<Option<Entity>, StorageError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE path = $1 AND active");
        self.fetch_entity(&sql, path.as_str()).await
    }

    async fn get_by_paths(&self, paths: &[EntityPath]) -> Result<Vec<Entity>, StorageError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE active AND path = ANY($1) ORDER BY depth"
        );
        let rows: Vec<EntityRow> = query_as(&sql)
            .bind(path_strings(paths))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "get_by_paths"))?;
        rows.into_iter().map(entity_from_row).collect()
    }

    async fn query_by_path_prefix(
        &self,
        prefix: &EntityPath,
    ) -> Result<Vec<Entity>, StorageError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE active AND path LIKE $1 ORDER BY path"
        );
        let rows: Vec<EntityRow> = query_as(&sql)
            .bind(prefix.descendant_like_pattern())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "query_by_path_prefix"))?;
        rows.into_iter().map(entity_from_row).collect()
    }

    async fn count_descendants(&self, prefix: &EntityPath) -> Result<u64, StorageError> {
        let count: i64 = query_scalar("SELECT count(*) FROM entities WHERE active AND path LIKE $1")
            .bind(prefix.descendant_like_pattern())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "count_descendants"))?;
        Ok(to_u64(count))
    }

    async fn list_ids(&self, scope: Option<&EntityPath>) -> Result<Vec<EntityId>, StorageError> {
        let ids: Vec<String> = match scope {
            Some(scope) => query_scalar::<_, String>(
                "SELECT entity_id FROM entities \
                 WHERE active AND (path = $1 OR path LIKE $2) ORDER BY path",
            )
            .bind(scope.as_str())
            .bind(scope.descendant_like_pattern())
            .fetch_all(&self.pool)
            .await,
            None => {
                query_scalar::<_, String>("SELECT entity_id FROM entities WHERE active ORDER BY path")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error(e, "list_ids"))?;
        Ok(ids.into_iter().map(EntityId::new).collect())
    }

    async fn get_ancestors_by_join(
        &self,
        id: &EntityId,
    ) -> Result<Option<MaterializedAnswer>, StorageError> {
        // join_column is validated as a plain identifier on construction
        let sql = format!(
            "SELECT m.entity_id, m.ancestors, m.descendant_count, m.computed_at, m.source_hash, \
                    e.path, e.revision \
             FROM entities e \
             JOIN materialized_answers m ON m.{col}::text = e.entity_id \
             WHERE e.entity_id = $1 AND e.active",
            col = self.join_column.as_str()
        );
        let joined: Option<JoinedRow> = match query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(e) if has_pg_error_code(&e, PG_UNDEFINED_COLUMN) => {
                tracing::error!(
                    entity_id = %id,
                    join_column = %self.join_column,
                    error = %e,
                    "answer join references an unknown column"
                );
                return Err(StorageError::schema_violation(
                    id.as_str(),
                    self.join_column.as_str(),
                    format!("join column does not exist: {e}"),
                ));
            }
            Err(e) => return Err(map_sqlx_error(e, "get_ancestors_by_join")),
        };

        match joined {
            Some((entity_id, ancestors, count, computed_at, source_hash, path, revision)) => {
                let source_hash = SourceHash(to_u64(source_hash));
                if source_hash.predates(to_u64(revision)) {
                    return Ok(None);
                }
                Ok(Some(MaterializedAnswer {
                    entity_id: EntityId::new(entity_id),
                    path: stored_path(&path)?,
                    ancestors,
                    descendant_count: to_u64(count),
                    computed_at: chrono_to_time(computed_at),
                    source_hash,
                }))
            }
            None => {
                if self.answer_row_exists(id).await? && self.get_by_id(id).await?.is_some() {
                    tracing::error!(
                        entity_id = %id,
                        join_column = %self.join_column,
                        "materialized row exists but entity join returned no match"
                    );
                    return Err(StorageError::schema_violation(
                        id.as_str(),
                        self.join_column.as_str(),
                        "materialized row exists but the join returned no match",
                    ));
                }
                Ok(None)
            }
        }
    }

    async fn current_revision(&self) -> Result<u64, StorageError> {
        let value: i64 = query_scalar("SELECT value FROM lineage_revision WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "current_revision"))?;
        Ok(to_u64(value))
    }

    async fn create_entity(&self, new: NewEntity) -> Result<MutationOutcome, StorageError> {
        if new.name.trim().is_empty() {
            return Err(StorageError::invalid_entity("name must not be empty"));
        }
        let confidence = normalize_confidence(new.confidence)?;
        let id = new
            .id
            .unwrap_or_else(|| EntityId::new(uuid::Uuid::new_v4().to_string()));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "create_entity"))?;

        if let Some(parent) = new.path.parent()
            && !path_is_active(&mut tx, &parent).await?
        {
            return Err(StorageError::orphaned_path(new.path.as_str(), parent.as_str()));
        }

        let revision = next_revision(&mut tx).await?;
        let content_hash = Entity::compute_content_hash(&new.name, &new.entity_type, &new.path);
        let sql = format!(
            "INSERT INTO entities \
             (entity_id, name, entity_type, path, depth, content_hash, confidence, revision) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {ENTITY_COLUMNS}"
        );
        let row: EntityRow = query_as(&sql)
            .bind(id.as_str())
            .bind(&new.name)
            .bind(&new.entity_type)
            .bind(new.path.as_str())
            .bind(i32::try_from(new.path.depth()).unwrap_or(i32::MAX))
            .bind(&content_hash)
            .bind(confidence)
            .bind(revision)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::already_exists(format!("{id} at {}", new.path))
                } else {
                    map_sqlx_error(e, "create_entity")
                }
            })?;

        touch_paths(&mut tx, &new.path.ancestors(), revision).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "create_entity"))?;

        let entity = entity_from_row(row)?;
        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Created,
            revision: to_u64(revision),
        })
    }

    async fn rename_entity(
        &self,
        id: &EntityId,
        name: &str,
    ) -> Result<MutationOutcome, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::invalid_entity("name must not be empty"));
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "rename_entity"))?;
        let current = lock_active(&mut tx, id).await?;
        let revision = next_revision(&mut tx).await?;

        let sql = format!(
            "UPDATE entities SET name = $2, content_hash = $3, revision = $4, updated_at = now() \
             WHERE entity_id = $1 RETURNING {ENTITY_COLUMNS}"
        );
        let row: EntityRow = query_as(&sql)
            .bind(id.as_str())
            .bind(name)
            .bind(Entity::compute_content_hash(
                name,
                &current.entity_type,
                &current.path,
            ))
            .bind(revision)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, "rename_entity"))?;
        touch_descendants(&mut tx, &current.path, revision).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "rename_entity"))?;

        let entity = entity_from_row(row)?;
        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Renamed,
            revision: to_u64(revision),
        })
    }

    async fn move_entity(
        &self,
        id: &EntityId,
        new_parent: &EntityPath,
    ) -> Result<MutationOutcome, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "move_entity"))?;
        let current = lock_active(&mut tx, id).await?;
        let old_path = current.path.clone();

        if old_path.is_prefix_of(new_parent) {
            return Err(StorageError::invalid_path(
                new_parent.as_str(),
                format!("cannot move '{old_path}' under its own subtree"),
            ));
        }
        if !path_is_active(&mut tx, new_parent).await? {
            return Err(StorageError::orphaned_path(
                old_path.as_str(),
                new_parent.as_str(),
            ));
        }
        let new_path = new_parent.child(old_path.leaf_label())?;
        if path_is_active(&mut tx, &new_path).await? {
            return Err(StorageError::already_exists(new_path.as_str()));
        }

        let revision = next_revision(&mut tx).await?;
        let subtree: Vec<(String, String, String, String)> = query_as(
            "SELECT entity_id, name, entity_type, path FROM entities \
             WHERE active AND (path = $1 OR path LIKE $2) FOR UPDATE",
        )
        .bind(old_path.as_str())
        .bind(old_path.descendant_like_pattern())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, "move_entity"))?;

        for (member, name, entity_type, path) in &subtree {
            let Some(rebased) = stored_path(path)?.rebase(&old_path, &new_path) else {
                continue;
            };
            query(
                "UPDATE entities SET path = $2, depth = $3, content_hash = $4, revision = $5, \
                 updated_at = now() WHERE entity_id = $1",
            )
            .bind(member)
            .bind(rebased.as_str())
            .bind(i32::try_from(rebased.depth()).unwrap_or(i32::MAX))
            .bind(Entity::compute_content_hash(name, entity_type, &rebased))
            .bind(revision)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, "move_entity"))?;
        }

        let mut touched = old_path.ancestors();
        touched.extend(new_path.ancestors());
        touch_paths(&mut tx, &touched, revision).await?;

        let entity = lock_active(&mut tx, id).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "move_entity"))?;

        tracing::debug!(
            entity_id = %id,
            from = %old_path,
            to = %new_path,
            moved = subtree.len(),
            "moved subtree"
        );
        Ok(MutationOutcome {
            entity,
            kind: MutationKind::Moved,
            revision: to_u64(revision),
            affected_prefixes: vec![old_path, new_path],
        })
    }

    async fn deactivate_entity(&self, id: &EntityId) -> Result<MutationOutcome, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "deactivate_entity"))?;
        let current = lock_active(&mut tx, id).await?;

        let children: i64 =
            query_scalar("SELECT count(*) FROM entities WHERE active AND path LIKE $1")
                .bind(current.path.descendant_like_pattern())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(e, "deactivate_entity"))?;
        if children > 0 {
            return Err(StorageError::has_active_descendants(
                id.as_str(),
                to_u64(children),
            ));
        }

        let revision = next_revision(&mut tx).await?;
        let sql = format!(
            "UPDATE entities SET active = FALSE, revision = $2, updated_at = now() \
             WHERE entity_id = $1 RETURNING {ENTITY_COLUMNS}"
        );
        let row: EntityRow = query_as(&sql)
            .bind(id.as_str())
            .bind(revision)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, "deactivate_entity"))?;
        touch_paths(&mut tx, &current.path.ancestors(), revision).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "deactivate_entity"))?;

        Ok(MutationOutcome {
            entity: entity_from_row(row)?,
            kind: MutationKind::Deactivated,
            revision: to_u64(revision),
            affected_prefixes: vec![current.path],
        })
    }

    async fn set_confidence(
        &self,
        id: &EntityId,
        confidence: Option<f64>,
    ) -> Result<MutationOutcome, StorageError> {
        let confidence = normalize_confidence(confidence)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "set_confidence"))?;
        lock_active(&mut tx, id).await?;
        let revision = next_revision(&mut tx).await?;

        let sql = format!(
            "UPDATE entities SET confidence = $2, revision = $3, updated_at = now() \
             WHERE entity_id = $1 RETURNING {ENTITY_COLUMNS}"
        );
        let row: EntityRow = query_as(&sql)
            .bind(id.as_str())
            .bind(confidence)
            .bind(revision)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, "set_confidence"))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "set_confidence"))?;

        let entity = entity_from_row(row)?;
        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Updated,
            revision: to_u64(revision),
        })
    }

    fn join_column(&self) -> &JoinColumn {
        &self.join_column
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl ViewStore for PostgresStore {
    async fn upsert_answer(&self, answer: &MaterializedAnswer) -> Result<bool, StorageError> {
        let result = query(
            "INSERT INTO materialized_answers \
             (entity_id, path, ancestors, descendant_count, computed_at, source_hash) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (entity_id) DO UPDATE SET \
                path = EXCLUDED.path, \
                ancestors = EXCLUDED.ancestors, \
                descendant_count = EXCLUDED.descendant_count, \
                computed_at = EXCLUDED.computed_at, \
                source_hash = EXCLUDED.source_hash \
             WHERE materialized_answers.source_hash <= EXCLUDED.source_hash",
        )
        .bind(answer.entity_id.as_str())
        .bind(answer.path.as_str())
        .bind(&answer.ancestors)
        .bind(to_i64(answer.descendant_count))
        .bind(time_to_chrono(answer.computed_at))
        .bind(to_i64(answer.source_hash.0))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "upsert_answer"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_answer(&self, id: &EntityId) -> Result<bool, StorageError> {
        let result = query("DELETE FROM materialized_answers WHERE entity_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "delete_answer"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_answer(&self, id: &EntityId) -> Result<Option<MaterializedAnswer>, StorageError> {
        let row: Option<AnswerRow> = query_as(
            "SELECT entity_id, path, ancestors, descendant_count, computed_at, source_hash \
             FROM materialized_answers WHERE entity_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "get_answer"))?;
        row.map(answer_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversion_round_trip() {
        let now = OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap()
            + time::Duration::nanoseconds(123_456_000);
        assert_eq!(chrono_to_time(time_to_chrono(now)), now);
    }

    #[test]
    fn test_numeric_saturation() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u64(-5), 0);
    }

    #[test]
    fn test_corrupt_path_is_internal() {
        let err = stored_path("root..x").unwrap_err();
        assert!(matches!(err, StorageError::Internal { .. }));
    }
}
