/// SQLite-backed task store.
///
/// The store owns the single write path to the database. Writes serialise
/// behind an internal mutex so invariants (id uniqueness, cycle freedom)
/// are checked and enforced transactionally; file-backed databases are
/// additionally guarded by the cross-process advisory lock. Reads are plain
/// pool queries and can run concurrently; dropping a read future cancels it
/// with no side effects.
use crate::config::{DatabaseUrl, EngineConfig};
use crate::errors::{TaskError, TaskResult};
use crate::graph::DependencyGraph;
use crate::ids::{self, PROJECT_ROOT_ID};
use crate::lock::ProcessLock;
use crate::reconcile::{
    GraphOperation, GraphReconciliationPlan, ReconciliationPlan, TreeOperation,
};
use crate::task::{
    ContextSlice, ContextSliceDraft, Task, TaskDependency, TaskDraft, TaskListFilter,
    TaskStatistics, TaskStatus, TaskUpdate,
};
use crate::tree::TaskTree;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TASK_COLUMNS: &str =
    "id, parent_id, title, description, status, priority_score, prd, context_digest, created_at, updated_at";

/// Attempts at minting a fresh random id before giving up.
const ID_ALLOCATION_ATTEMPTS: usize = 16;

/// Result of executing a tree reconciliation plan.
#[derive(Debug, Clone)]
pub struct TreeReconcileOutcome {
    /// The persisted tree rooted where the plan indicated.
    pub tree: TaskTree,
    /// Canonical ids minted for every temporary id in the plan.
    pub id_mappings: HashMap<String, String>,
}

#[derive(Debug)]
pub struct TaskStore {
    pool: SqlitePool,

    /// Serialises all write operations.
    write_lock: tokio::sync::Mutex<()>,

    /// Advisory cross-process lock; None for non-file backends.
    lock: std::sync::Mutex<Option<ProcessLock>>,

    url: DatabaseUrl,
}

impl TaskStore {
    /// Open (and if necessary create) the database named by the
    /// configuration, acquiring the advisory lock for file-backed
    /// databases and applying pending migrations.
    pub async fn open(config: &EngineConfig) -> TaskResult<Self> {
        let (connect_options, lock, pool_options) = match &config.database_url {
            DatabaseUrl::Sqlite(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let lock = ProcessLock::acquire(path, &config.process_label)?;
                let options = SqliteConnectOptions::from_str(path.to_string_lossy().as_ref())
                    .map_err(|e| {
                        TaskError::Storage(format!("failed to parse database path: {e}"))
                    })?
                    .create_if_missing(true)
                    .foreign_keys(true);
                let pool_options = SqlitePoolOptions::new()
                    .max_connections(5)
                    .min_connections(1)
                    .acquire_timeout(std::time::Duration::from_secs(30));
                (options, Some(lock), pool_options)
            }
            DatabaseUrl::Memory(label) => {
                debug!(label = %label, "opening ephemeral in-memory database");
                let options = SqliteConnectOptions::from_str(":memory:")
                    .map_err(|e| {
                        TaskError::Storage(format!("failed to parse memory database uri: {e}"))
                    })?
                    .foreign_keys(true);
                // The database lives in its single connection; the pool
                // must never recycle it.
                let pool_options = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .max_lifetime(None)
                    .idle_timeout(None)
                    .acquire_timeout(std::time::Duration::from_secs(30));
                (options, None, pool_options)
            }
            other => {
                return Err(TaskError::Storage(format!(
                    "database backend not supported by this build: {other}"
                )))
            }
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to create database pool: {e}")))?;

        let store = TaskStore {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
            lock: std::sync::Mutex::new(lock),
            url: config.database_url.clone(),
        };
        store.apply_migrations().await?;
        store.ensure_project_root().await?;
        info!(database = %store.url, "task store opened");
        Ok(store)
    }

    /// The database location this store serves.
    pub fn database_url(&self) -> &DatabaseUrl {
        &self.url
    }

    /// Release the advisory lock and close the connection pool.
    /// Idempotent.
    pub async fn close(&self) {
        let lock = match self.lock.lock() {
            Ok(mut guard) => guard.take(),
            Err(mut poisoned) => poisoned.get_mut().take(),
        };
        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                warn!("failed to release advisory lock: {e}");
            }
        }
        self.pool.close().await;
    }

    /// Operational recovery: remove the advisory lock sentinel for a
    /// database path without opening the database.
    pub fn force_unlock(db_path: &Path) -> TaskResult<bool> {
        ProcessLock::force_unlock(db_path)
    }

    async fn apply_migrations(&self) -> TaskResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to create migrations table: {e}")))?;

        let max_version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    TaskError::Storage(format!("failed to query migration version: {e}"))
                })?;

        let migrations: Vec<(i32, &str, &str, Vec<&str>)> = vec![
            (
                1,
                "create_tasks",
                "Create tasks table",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS tasks (
                        id TEXT PRIMARY KEY NOT NULL,
                        parent_id TEXT REFERENCES tasks(id),
                        title TEXT NOT NULL,
                        description TEXT,
                        status TEXT NOT NULL DEFAULT 'pending',
                        priority_score INTEGER NOT NULL DEFAULT 50,
                        prd TEXT,
                        context_digest TEXT,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_parent_status ON tasks(parent_id, status)"#,
                ],
            ),
            (
                2,
                "create_task_dependencies",
                "Create task dependency edges",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS task_dependencies (
                        id TEXT PRIMARY KEY NOT NULL,
                        dependent_task_id TEXT NOT NULL REFERENCES tasks(id),
                        dependency_task_id TEXT NOT NULL REFERENCES tasks(id),
                        created_at INTEGER NOT NULL,
                        UNIQUE(dependent_task_id, dependency_task_id),
                        CHECK(dependent_task_id <> dependency_task_id)
                    )"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_task_dependencies_dependent ON task_dependencies(dependent_task_id)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_task_dependencies_dependency ON task_dependencies(dependency_task_id)"#,
                ],
            ),
            (
                3,
                "create_context_slices",
                "Create context slices",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS context_slices (
                        id TEXT PRIMARY KEY NOT NULL,
                        task_id TEXT NOT NULL REFERENCES tasks(id),
                        title TEXT NOT NULL,
                        description TEXT NOT NULL,
                        context_type TEXT NOT NULL DEFAULT 'general',
                        created_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_context_slices_task_id ON context_slices(task_id)"#,
                ],
            ),
        ];

        for (version, name, description, statements) in migrations {
            if version > max_version {
                for statement in statements {
                    sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                        TaskError::Storage(format!("failed to apply migration {name}: {e}"))
                    })?;
                }
                sqlx::query(
                    "INSERT INTO migrations (version, name, description, applied_at) VALUES (?, ?, ?, ?)",
                )
                .bind(version)
                .bind(name)
                .bind(Some(description))
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    TaskError::Storage(format!("failed to record migration {name}: {e}"))
                })?;
                debug!(migration = name, version, "applied migration");
            }
        }

        Ok(())
    }

    /// Seed the synthetic project root if it is absent.
    async fn ensure_project_root(&self) -> TaskResult<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks
                (id, parent_id, title, status, priority_score, created_at, updated_at)
            VALUES (?, NULL, 'Project Root', 'pending', 0, ?, ?)
            "#,
        )
        .bind(PROJECT_ROOT_ID)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to seed project root: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task CRUD
    // ------------------------------------------------------------------

    /// Create a task under its draft parent (the project root when the
    /// draft names none), minting a canonical id.
    pub async fn add_task(&self, draft: &TaskDraft) -> TaskResult<Task> {
        draft.validate()?;
        let parent_id = draft
            .parent_id
            .clone()
            .unwrap_or_else(|| PROJECT_ROOT_ID.to_string());

        let _guard = self.write_lock.lock().await;
        if !self.task_exists(&parent_id).await? {
            return Err(TaskError::NotFound(format!("parent task {parent_id}")));
        }

        let id = self.allocate_task_id(&parent_id).await?;
        let task = draft.clone().into_task(id, parent_id, Utc::now());
        insert_task(&self.pool, &task).await?;
        debug!(id = %task.id, parent = ?task.parent_id, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> TaskResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to fetch task: {e}")))?;
        row.map(|r| parse_task_row(&r)).transpose()
    }

    /// Merge a partial update into a task; bumps `updated_at`. Returns
    /// None when the id is unknown.
    pub async fn update_task(&self, id: &str, update: &TaskUpdate) -> TaskResult<Option<Task>> {
        update.validate()?;
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };
        if task.is_project_root() {
            return Err(TaskError::Conflict(
                "the project root cannot be modified".to_string(),
            ));
        }
        if let Some(new_parent) = &update.parent_id {
            self.assert_reparent_allowed(id, new_parent).await?;
        }
        update.apply_to(&mut task, Utc::now());
        update_task_row(&self.pool, &task).await?;
        Ok(Some(task))
    }

    /// Convenience wrapper for a status-only update.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> TaskResult<Option<Task>> {
        self.update_task(id, &TaskUpdate::status(status)).await
    }

    /// Delete one task. Refuses while children or dependents exist; the
    /// facade's delete-tree composes the cascading form out of
    /// reconciliation plans.
    pub async fn delete_task(&self, id: &str) -> TaskResult<bool> {
        let _guard = self.write_lock.lock().await;
        if !self.task_exists(id).await? {
            return Ok(false);
        }
        if ids::is_project_root(id) {
            return Err(TaskError::Conflict(
                "the project root cannot be deleted".to_string(),
            ));
        }
        let children = self.count_children(&self.pool, id).await?;
        if children > 0 {
            return Err(TaskError::Conflict(format!(
                "task {id} has {children} children; delete them first or use a cascading delete"
            )));
        }
        let dependents = self.count_dependents(&self.pool, id).await?;
        if dependents > 0 {
            return Err(TaskError::Conflict(format!(
                "task {id} has {dependents} dependents; remove their dependency edges first"
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TaskError::Storage(format!("failed to begin transaction: {e}")))?;
        sqlx::query("DELETE FROM context_slices WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to delete context slices: {e}")))?;
        sqlx::query("DELETE FROM task_dependencies WHERE dependent_task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to delete dependency edges: {e}")))?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to delete task: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| TaskError::Storage(format!("failed to commit delete: {e}")))?;
        debug!(id, "task deleted");
        Ok(true)
    }

    /// List tasks with conjunctive filters. An empty status list means any
    /// status; the project root is suppressed unless asked for.
    pub async fn list_tasks(&self, filter: &TaskListFilter) -> TaskResult<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(statuses) = &filter.statuses {
            if !statuses.is_empty() {
                let placeholders: Vec<&str> = statuses.iter().map(|_| "?").collect();
                clauses.push(format!("status IN ({})", placeholders.join(", ")));
                for status in statuses {
                    params.push(status.to_string());
                }
            }
        }
        if let Some(parent) = &filter.parent_id {
            clauses.push("parent_id = ?".to_string());
            params.push(parent.clone());
        }
        if !filter.include_project_root {
            clauses.push("id <> ?".to_string());
            params.push(PROJECT_ROOT_ID.to_string());
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to list tasks: {e}")))?;
        rows.iter().map(parse_task_row).collect()
    }

    /// Per-status task counts, excluding the project root.
    pub async fn task_statistics(&self) -> TaskResult<TaskStatistics> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks WHERE id <> ? GROUP BY status")
            .bind(PROJECT_ROOT_ID)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to count tasks: {e}")))?;

        let mut stats = TaskStatistics {
            total: 0,
            pending: 0,
            in_progress: 0,
            done: 0,
            cancelled: 0,
            archived: 0,
        };
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            let count = count as usize;
            stats.total += count;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => stats.pending += count,
                Ok(TaskStatus::InProgress) => stats.in_progress += count,
                Ok(TaskStatus::Done) => stats.done += count,
                Ok(TaskStatus::Cancelled) => stats.cancelled += count,
                Ok(TaskStatus::Archived) => stats.archived += count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Add a dependency edge. Rejects self-edges, duplicates, unknown
    /// endpoints, and edges that would close a cycle; the check runs
    /// against a freshly loaded graph.
    pub async fn add_task_dependency(
        &self,
        dependent: &str,
        dependency: &str,
    ) -> TaskResult<TaskDependency> {
        ids::validate_id(dependent)?;
        ids::validate_id(dependency)?;
        let _guard = self.write_lock.lock().await;
        if dependent == dependency {
            return Err(TaskError::Conflict(format!(
                "task {dependent} cannot depend on itself"
            )));
        }
        if !self.task_exists(dependent).await? {
            return Err(TaskError::NotFound(format!("task {dependent}")));
        }
        if !self.task_exists(dependency).await? {
            return Err(TaskError::NotFound(format!("task {dependency}")));
        }

        let graph = self.load_dependency_graph().await?;
        if graph.has_edge(dependent, dependency) {
            return Err(TaskError::Conflict(format!(
                "dependency {dependent} -> {dependency} already exists"
            )));
        }
        if graph.would_create_cycle(dependent, dependency) {
            let cycle = graph
                .cycle_path(dependent, dependency)
                .unwrap_or_else(|| vec![dependent.to_string(), dependency.to_string()]);
            return Err(TaskError::Conflict(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        let dep = TaskDependency {
            id: Uuid::new_v4(),
            dependent_task_id: dependent.to_string(),
            dependency_task_id: dependency.to_string(),
            created_at: Utc::now(),
        };
        insert_dependency(&self.pool, &dep).await?;
        debug!(dependent, dependency, "dependency added");
        Ok(dep)
    }

    /// Remove a dependency edge; returns false when it did not exist.
    pub async fn remove_task_dependency(
        &self,
        dependent: &str,
        dependency: &str,
    ) -> TaskResult<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM task_dependencies WHERE dependent_task_id = ? AND dependency_task_id = ?",
        )
        .bind(dependent)
        .bind(dependency)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to remove dependency: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// All dependency edges, oldest first.
    pub async fn list_dependencies(&self) -> TaskResult<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT id, dependent_task_id, dependency_task_id, created_at FROM task_dependencies ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to list dependencies: {e}")))?;
        rows.iter().map(parse_dependency_row).collect()
    }

    // ------------------------------------------------------------------
    // Context slices
    // ------------------------------------------------------------------

    pub async fn add_context_slice(&self, draft: &ContextSliceDraft) -> TaskResult<ContextSlice> {
        draft.validate()?;
        let _guard = self.write_lock.lock().await;
        if !self.task_exists(&draft.task_id).await? {
            return Err(TaskError::NotFound(format!("task {}", draft.task_id)));
        }
        let slice = ContextSlice {
            id: Uuid::new_v4(),
            task_id: draft.task_id.clone(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            context_type: draft
                .context_type
                .clone()
                .unwrap_or_else(|| "general".to_string()),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO context_slices (id, task_id, title, description, context_type, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(slice.id.to_string())
        .bind(&slice.task_id)
        .bind(&slice.title)
        .bind(&slice.description)
        .bind(&slice.context_type)
        .bind(slice.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to insert context slice: {e}")))?;
        Ok(slice)
    }

    pub async fn list_context_slices(&self, task_id: &str) -> TaskResult<Vec<ContextSlice>> {
        let rows = sqlx::query(
            "SELECT id, task_id, title, description, context_type, created_at FROM context_slices WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TaskError::Storage(format!("failed to list context slices: {e}")))?;
        rows.iter().map(parse_slice_row).collect()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Load the tree rooted at `root_id` (commonly the project root).
    pub async fn build_task_tree(&self, root_id: &str) -> TaskResult<TaskTree> {
        ids::validate_id(root_id)?;
        let tasks = self
            .list_tasks(&TaskListFilter {
                include_project_root: true,
                ..Default::default()
            })
            .await?;
        TaskTree::from_tasks(tasks, root_id)
            .ok_or_else(|| TaskError::NotFound(format!("task {root_id}")))
    }

    /// Load the dependency graph over all user tasks (statuses included).
    pub async fn build_dependency_graph(&self) -> TaskResult<DependencyGraph> {
        self.load_dependency_graph().await
    }

    async fn load_dependency_graph(&self) -> TaskResult<DependencyGraph> {
        let tasks = self.list_tasks(&TaskListFilter::default()).await?;
        let edges = self.list_dependencies().await?;
        Ok(DependencyGraph::from_parts(
            edges
                .into_iter()
                .map(|d| (d.dependent_task_id, d.dependency_task_id)),
            tasks.into_iter().map(|t| (t.id, t.status)),
        ))
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply a tracking tree's plan atomically: either every operation
    /// lands or none are visible to subsequent readers. Temporary ids in
    /// `child_add` payloads are replaced with canonical ids and the full
    /// mapping is returned alongside the resulting tree.
    pub async fn execute_reconciliation_operations(
        &self,
        plan: &ReconciliationPlan,
    ) -> TaskResult<TreeReconcileOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut mappings: HashMap<String, String> = HashMap::new();

        if !plan.operations.is_empty() {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| TaskError::Storage(format!("failed to begin transaction: {e}")))?;
            for (index, op) in plan.operations.iter().enumerate() {
                if let Err(e) = self.apply_tree_operation(&mut tx, op, &mut mappings).await {
                    let _ = tx.rollback().await;
                    return Err(e.into_reconciliation(index));
                }
            }
            tx.commit().await.map_err(|e| TaskError::Reconciliation {
                index: plan.operations.len(),
                message: format!("failed to commit reconciliation plan: {e}"),
            })?;
            debug!(
                operations = plan.operations.len(),
                minted = mappings.len(),
                "reconciliation plan applied"
            );
        }

        let root_id = resolve_mapped(&plan.root_id, &mappings);
        let tree = self.build_task_tree(&root_id).await?;
        Ok(TreeReconcileOutcome { tree, id_mappings: mappings })
    }

    async fn apply_tree_operation(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        op: &TreeOperation,
        mappings: &mut HashMap<String, String>,
    ) -> TaskResult<()> {
        match op {
            TreeOperation::ChildAdd { parent_id, child, .. } => {
                let parent = resolve_mapped(parent_id, mappings);
                if ids::is_temp_id(&parent) {
                    return Err(TaskError::Validation(format!(
                        "unmapped temporary parent id {parent}"
                    )));
                }
                let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
                    .bind(&parent)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| TaskError::Storage(format!("failed to check parent: {e}")))?;
                if exists.is_none() {
                    return Err(TaskError::NotFound(format!("parent task {parent}")));
                }

                crate::task::validate_title(&child.title)?;
                if let Some(description) = &child.description {
                    crate::task::validate_description(description)?;
                }
                crate::task::validate_priority_score(child.priority_score)?;

                let real_id = if ids::is_temp_id(&child.id) {
                    let real = self.allocate_task_id_in(tx, &parent).await?;
                    mappings.insert(child.id.clone(), real.clone());
                    real
                } else {
                    if !ids::is_canonical_id(&child.id) {
                        return Err(TaskError::Validation(format!(
                            "invalid task id {:?}",
                            child.id
                        )));
                    }
                    let taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
                        .bind(&child.id)
                        .fetch_optional(&mut **tx)
                        .await
                        .map_err(|e| TaskError::Storage(format!("failed to check id: {e}")))?;
                    if taken.is_some() {
                        return Err(TaskError::Conflict(format!(
                            "task id {} already exists",
                            child.id
                        )));
                    }
                    child.id.clone()
                };

                let mut task = child.clone();
                task.id = real_id;
                task.parent_id = Some(parent);
                insert_task(&mut **tx, &task).await?;
                Ok(())
            }
            TreeOperation::ChildRemove { parent_id, child_id, .. } => {
                let parent = resolve_mapped(parent_id, mappings);
                let child = resolve_mapped(child_id, mappings);
                let row = sqlx::query("SELECT parent_id FROM tasks WHERE id = ?")
                    .bind(&child)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| TaskError::Storage(format!("failed to fetch task: {e}")))?;
                let Some(row) = row else {
                    return Err(TaskError::NotFound(format!("task {child}")));
                };
                let actual_parent: Option<String> = row.get("parent_id");
                if actual_parent.as_deref() != Some(parent.as_str()) {
                    return Err(TaskError::Conflict(format!(
                        "{child} is not a child of {parent}"
                    )));
                }

                let children: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE parent_id = ?")
                        .bind(&child)
                        .fetch_one(&mut **tx)
                        .await
                        .map_err(|e| TaskError::Storage(format!("failed to count children: {e}")))?;
                if children > 0 {
                    return Err(TaskError::Conflict(format!(
                        "task {child} still has {children} children"
                    )));
                }
                let dependents: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM task_dependencies WHERE dependency_task_id = ?",
                )
                .bind(&child)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| TaskError::Storage(format!("failed to count dependents: {e}")))?;
                if dependents > 0 {
                    return Err(TaskError::Conflict(format!(
                        "task {child} still has {dependents} dependents"
                    )));
                }

                sqlx::query("DELETE FROM context_slices WHERE task_id = ?")
                    .bind(&child)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| {
                        TaskError::Storage(format!("failed to delete context slices: {e}"))
                    })?;
                sqlx::query("DELETE FROM task_dependencies WHERE dependent_task_id = ?")
                    .bind(&child)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| {
                        TaskError::Storage(format!("failed to delete dependency edges: {e}"))
                    })?;
                sqlx::query("DELETE FROM tasks WHERE id = ?")
                    .bind(&child)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| TaskError::Storage(format!("failed to delete task: {e}")))?;
                Ok(())
            }
            TreeOperation::TaskUpdate { task_id, updates, .. } => {
                updates.validate()?;
                if updates.parent_id.is_some() {
                    return Err(TaskError::Validation(
                        "reparenting is not supported in a reconciliation plan".to_string(),
                    ));
                }
                let id = resolve_mapped(task_id, mappings);
                let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                    .bind(&id)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| TaskError::Storage(format!("failed to fetch task: {e}")))?;
                let Some(row) = row else {
                    return Err(TaskError::NotFound(format!("task {id}")));
                };
                let mut task = parse_task_row(&row)?;
                if task.is_project_root() {
                    return Err(TaskError::Conflict(
                        "the project root cannot be modified".to_string(),
                    ));
                }
                updates.apply_to(&mut task, Utc::now());
                update_task_row(&mut **tx, &task).await?;
                Ok(())
            }
        }
    }

    /// Apply a tracking graph's plan atomically, returning the resulting
    /// dependency graph.
    pub async fn apply_reconciliation_plan(
        &self,
        plan: &GraphReconciliationPlan,
    ) -> TaskResult<DependencyGraph> {
        let _guard = self.write_lock.lock().await;
        let mut graph = self.load_dependency_graph().await?;
        if plan.operations.is_empty() {
            return Ok(graph);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TaskError::Storage(format!("failed to begin transaction: {e}")))?;
        for (index, op) in plan.operations.iter().enumerate() {
            if let Err(e) = apply_graph_operation(&mut tx, &mut graph, op).await {
                let _ = tx.rollback().await;
                return Err(e.into_reconciliation(index));
            }
        }
        tx.commit().await.map_err(|e| TaskError::Reconciliation {
            index: plan.operations.len(),
            message: format!("failed to commit graph plan: {e}"),
        })?;
        debug!(operations = plan.operations.len(), "graph plan applied");
        Ok(graph)
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    async fn task_exists(&self, id: &str) -> TaskResult<bool> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to check task existence: {e}")))?;
        Ok(exists.is_some())
    }

    async fn count_children(&self, pool: &SqlitePool, id: &str) -> TaskResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE parent_id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to count children: {e}")))
    }

    async fn count_dependents(&self, pool: &SqlitePool, id: &str) -> TaskResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM task_dependencies WHERE dependency_task_id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to count dependents: {e}")))
    }

    /// A descendant cannot become its own ancestor.
    async fn assert_reparent_allowed(&self, id: &str, new_parent: &str) -> TaskResult<()> {
        if new_parent == id {
            return Err(TaskError::Conflict(format!(
                "task {id} cannot be its own parent"
            )));
        }
        if !self.task_exists(new_parent).await? {
            return Err(TaskError::NotFound(format!("parent task {new_parent}")));
        }
        let rows = sqlx::query("SELECT id, parent_id FROM tasks")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to load parent relation: {e}")))?;
        let parents: HashMap<String, Option<String>> = rows
            .iter()
            .map(|row| (row.get("id"), row.get("parent_id")))
            .collect();

        let mut cursor = Some(new_parent.to_string());
        while let Some(current) = cursor {
            if current == id {
                return Err(TaskError::Conflict(format!(
                    "moving {id} under {new_parent} would create a parent cycle"
                )));
            }
            cursor = parents.get(&current).cloned().flatten();
        }
        Ok(())
    }

    async fn allocate_task_id(&self, parent_id: &str) -> TaskResult<String> {
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let candidate = ids::compose_child_id(parent_id);
            if !self.task_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(TaskError::Storage(format!(
            "failed to allocate a unique id under {parent_id}"
        )))
    }

    async fn allocate_task_id_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        parent_id: &str,
    ) -> TaskResult<String> {
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let candidate = ids::compose_child_id(parent_id);
            let taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
                .bind(&candidate)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| TaskError::Storage(format!("failed to check id: {e}")))?;
            if taken.is_none() {
                return Ok(candidate);
            }
        }
        Err(TaskError::Storage(format!(
            "failed to allocate a unique id under {parent_id}"
        )))
    }
}

async fn apply_graph_operation(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    graph: &mut DependencyGraph,
    op: &GraphOperation,
) -> TaskResult<()> {
    let (dependent, dependency) = op.endpoints();
    if ids::is_temp_id(dependent) || ids::is_temp_id(dependency) {
        return Err(TaskError::Validation(format!(
            "unmapped temporary id in dependency {dependent} -> {dependency}"
        )));
    }
    match op {
        GraphOperation::DependencyAdd { .. } => {
            if dependent == dependency {
                return Err(TaskError::Conflict(format!(
                    "task {dependent} cannot depend on itself"
                )));
            }
            for endpoint in [dependent, dependency] {
                let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
                    .bind(endpoint)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| TaskError::Storage(format!("failed to check task: {e}")))?;
                if exists.is_none() {
                    return Err(TaskError::NotFound(format!("task {endpoint}")));
                }
            }
            if graph.has_edge(dependent, dependency) {
                return Err(TaskError::Conflict(format!(
                    "dependency {dependent} -> {dependency} already exists"
                )));
            }
            if graph.would_create_cycle(dependent, dependency) {
                let cycle = graph
                    .cycle_path(dependent, dependency)
                    .unwrap_or_else(|| vec![dependent.to_string(), dependency.to_string()]);
                return Err(TaskError::Conflict(format!(
                    "dependency cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            let dep = TaskDependency {
                id: Uuid::new_v4(),
                dependent_task_id: dependent.to_string(),
                dependency_task_id: dependency.to_string(),
                created_at: Utc::now(),
            };
            insert_dependency(&mut **tx, &dep).await?;
            graph.add_edge(dependent, dependency);
            Ok(())
        }
        GraphOperation::DependencyRemove { .. } => {
            let result = sqlx::query(
                "DELETE FROM task_dependencies WHERE dependent_task_id = ? AND dependency_task_id = ?",
            )
            .bind(dependent)
            .bind(dependency)
            .execute(&mut **tx)
            .await
            .map_err(|e| TaskError::Storage(format!("failed to remove dependency: {e}")))?;
            if result.rows_affected() == 0 {
                return Err(TaskError::NotFound(format!(
                    "dependency {dependent} -> {dependency}"
                )));
            }
            graph.remove_edge(dependent, dependency);
            Ok(())
        }
    }
}

fn resolve_mapped(id: &str, mappings: &HashMap<String, String>) -> String {
    mappings.get(id).cloned().unwrap_or_else(|| id.to_string())
}

async fn insert_task<'c, E>(executor: E, task: &Task) -> TaskResult<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO tasks
            (id, parent_id, title, description, status, priority_score, prd, context_digest, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.parent_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.status.to_string())
    .bind(task.priority_score)
    .bind(&task.prd)
    .bind(&task.context_digest)
    .bind(task.created_at.timestamp_millis())
    .bind(task.updated_at.timestamp_millis())
    .execute(executor)
    .await
    .map_err(|e| TaskError::Storage(format!("failed to insert task: {e}")))?;
    Ok(())
}

async fn update_task_row<'c, E>(executor: E, task: &Task) -> TaskResult<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE tasks SET
            parent_id = ?, title = ?, description = ?, status = ?,
            priority_score = ?, prd = ?, context_digest = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&task.parent_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.status.to_string())
    .bind(task.priority_score)
    .bind(&task.prd)
    .bind(&task.context_digest)
    .bind(task.updated_at.timestamp_millis())
    .bind(&task.id)
    .execute(executor)
    .await
    .map_err(|e| TaskError::Storage(format!("failed to update task: {e}")))?;
    Ok(())
}

async fn insert_dependency<'c, E>(executor: E, dep: &TaskDependency) -> TaskResult<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO task_dependencies (id, dependent_task_id, dependency_task_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(dep.id.to_string())
    .bind(&dep.dependent_task_id)
    .bind(&dep.dependency_task_id)
    .bind(dep.created_at.timestamp_millis())
    .execute(executor)
    .await
    .map_err(|e| TaskError::Storage(format!("failed to insert dependency: {e}")))?;
    Ok(())
}

fn parse_timestamp(millis: i64) -> TaskResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| TaskError::Storage(format!("invalid timestamp in row: {millis}")))
}

fn parse_task_row(row: &SqliteRow) -> TaskResult<Task> {
    let status_text: String = row.get("status");
    let status = status_text
        .parse::<TaskStatus>()
        .map_err(|_| TaskError::Storage(format!("invalid status in row: {status_text:?}")))?;
    Ok(Task {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        title: row.get("title"),
        description: row.get("description"),
        status,
        priority_score: row.get("priority_score"),
        prd: row.get("prd"),
        context_digest: row.get("context_digest"),
        created_at: parse_timestamp(row.get("created_at"))?,
        updated_at: parse_timestamp(row.get("updated_at"))?,
    })
}

fn parse_dependency_row(row: &SqliteRow) -> TaskResult<TaskDependency> {
    let id_text: String = row.get("id");
    Ok(TaskDependency {
        id: Uuid::parse_str(&id_text)
            .map_err(|e| TaskError::Storage(format!("invalid dependency id: {e}")))?,
        dependent_task_id: row.get("dependent_task_id"),
        dependency_task_id: row.get("dependency_task_id"),
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn parse_slice_row(row: &SqliteRow) -> TaskResult<ContextSlice> {
    let id_text: String = row.get("id");
    Ok(ContextSlice {
        id: Uuid::parse_str(&id_text)
            .map_err(|e| TaskError::Storage(format!("invalid slice id: {e}")))?,
        task_id: row.get("task_id"),
        title: row.get("title"),
        description: row.get("description"),
        context_type: row.get("context_type"),
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}
