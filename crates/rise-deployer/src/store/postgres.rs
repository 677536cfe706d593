//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{DeployError, DeployResult};
use crate::state::DeploymentState;
use crate::types::{generate_prefix, Deployment, NewDeployment, Project, RawBundle, User};

use super::{DeploymentStore, DEFAULT_DOMAIN_SUFFIX};

/// PostgreSQL-backed [`DeploymentStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> DeployResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> DeployResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> DeployResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                email TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                user_id BIGINT NOT NULL,
                watermark BOOLEAN NOT NULL DEFAULT TRUE,
                force_https BOOLEAN NOT NULL DEFAULT FALSE,
                basic_auth_username TEXT,
                encrypted_basic_auth_password TEXT,
                max_deploys_kept BIGINT NOT NULL DEFAULT 0,
                active_deployment_id BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id BIGSERIAL PRIMARY KEY,
                project_id BIGINT NOT NULL REFERENCES projects(id),
                user_id BIGINT NOT NULL,
                prefix TEXT NOT NULL,
                version BIGINT NOT NULL,
                state TEXT NOT NULL,
                js_env_vars TEXT NOT NULL DEFAULT '{}',
                raw_bundle_id BIGINT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deployed_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ,
                UNIQUE (project_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_bundles (
                id BIGSERIAL PRIMARY KEY,
                project_id BIGINT NOT NULL REFERENCES projects(id),
                uploaded_path TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                id BIGSERIAL PRIMARY KEY,
                project_id BIGINT NOT NULL REFERENCES projects(id),
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project_state
            ON deployments (project_id, state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_deployment(row: &PgRow) -> DeployResult<Deployment> {
        let state_str: String = row.get("state");
        let state: DeploymentState = state_str
            .parse()
            .map_err(DeployError::Serialisation)?;

        Ok(Deployment {
            id: row.get("id"),
            project_id: row.get("project_id"),
            user_id: row.get("user_id"),
            prefix: row.get("prefix"),
            version: row.get("version"),
            state,
            js_env_vars: row.get("js_env_vars"),
            raw_bundle_id: row.get("raw_bundle_id"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            deployed_at: row.get("deployed_at"),
            deleted_at: row.get("deleted_at"),
        })
    }

    fn row_to_project(row: &PgRow) -> Project {
        Project {
            id: row.get("id"),
            name: row.get("name"),
            user_id: row.get("user_id"),
            watermark: row.get("watermark"),
            force_https: row.get("force_https"),
            basic_auth_username: row.get("basic_auth_username"),
            encrypted_basic_auth_password: row.get("encrypted_basic_auth_password"),
            max_deploys_kept: row.get("max_deploys_kept"),
            active_deployment_id: row.get("active_deployment_id"),
        }
    }
}

const DEPLOYMENT_COLUMNS: &str = "id, project_id, user_id, prefix, version, state, js_env_vars, \
                                  raw_bundle_id, error_message, created_at, deployed_at, deleted_at";

const PROJECT_COLUMNS: &str = "id, name, user_id, watermark, force_https, basic_auth_username, \
                               encrypted_basic_auth_password, max_deploys_kept, active_deployment_id";

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn find_deployment(&self, id: i64) -> DeployResult<Option<Deployment>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn find_project(&self, id: i64) -> DeployResult<Option<Project>> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn find_project_by_name(&self, name: &str) -> DeployResult<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn find_user(&self, id: i64) -> DeployResult<Option<User>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| User {
            id: r.get("id"),
            email: r.get("email"),
        }))
    }

    async fn find_raw_bundle(&self, id: i64) -> DeployResult<Option<RawBundle>> {
        let row = sqlx::query("SELECT id, project_id, uploaded_path FROM raw_bundles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| RawBundle {
            id: r.get("id"),
            project_id: r.get("project_id"),
            uploaded_path: r.get("uploaded_path"),
        }))
    }

    async fn insert_deployment(&self, new: NewDeployment) -> DeployResult<Deployment> {
        let prefix = generate_prefix();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO deployments (project_id, user_id, prefix, version, state, js_env_vars)
            VALUES (
                $1, $2, $3,
                (SELECT COALESCE(MAX(version), 0) + 1 FROM deployments WHERE project_id = $1),
                $4, $5
            )
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(new.project_id)
        .bind(new.user_id)
        .bind(&prefix)
        .bind(DeploymentState::PendingDeploy.as_str())
        .bind(&new.js_env_vars)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_deployment(&row)
    }

    async fn insert_raw_bundle(
        &self,
        project_id: i64,
        uploaded_path: &str,
    ) -> DeployResult<RawBundle> {
        let row = sqlx::query(
            r#"
            INSERT INTO raw_bundles (project_id, uploaded_path)
            VALUES ($1, $2)
            RETURNING id, project_id, uploaded_path
            "#,
        )
        .bind(project_id)
        .bind(uploaded_path)
        .fetch_one(&self.pool)
        .await?;

        Ok(RawBundle {
            id: row.get("id"),
            project_id: row.get("project_id"),
            uploaded_path: row.get("uploaded_path"),
        })
    }

    async fn attach_raw_bundle(&self, deployment_id: i64, raw_bundle_id: i64) -> DeployResult<()> {
        let result = sqlx::query("UPDATE deployments SET raw_bundle_id = $2 WHERE id = $1")
            .bind(deployment_id)
            .bind(raw_bundle_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::DeploymentNotFound(deployment_id));
        }
        Ok(())
    }

    async fn update_state(
        &self,
        id: i64,
        state: DeploymentState,
        error_message: Option<&str>,
    ) -> DeployResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM deployments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DeployError::DeploymentNotFound(id))?;

        let current: DeploymentState = row
            .get::<String, _>("state")
            .parse()
            .map_err(DeployError::Serialisation)?;

        if !current.can_transition(state) {
            return Err(DeployError::InvalidStateTransition {
                from: current.as_str(),
                to: state.as_str(),
            });
        }

        sqlx::query("UPDATE deployments SET state = $2, error_message = $3 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .bind(error_message)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn domain_names(&self, project: &Project) -> DeployResult<Vec<String>> {
        let mut names = vec![format!("{}{DEFAULT_DOMAIN_SUFFIX}", project.name)];

        let rows = sqlx::query("SELECT name FROM domains WHERE project_id = $1 ORDER BY id")
            .bind(project.id)
            .fetch_all(&self.pool)
            .await?;

        names.extend(rows.into_iter().map(|r| r.get::<String, _>("name")));
        Ok(names)
    }

    async fn finalize_deploy(
        &self,
        deployment_id: i64,
        project_id: i64,
        max_deploys_kept: i64,
    ) -> DeployResult<DateTime<Utc>> {
        // The transaction rolls back on drop, so any early return below
        // leaves every row untouched.
        let mut tx = self.pool.begin().await?;
        let deployed_at = Utc::now();

        let row = sqlx::query("SELECT state FROM deployments WHERE id = $1 FOR UPDATE")
            .bind(deployment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DeployError::DeploymentNotFound(deployment_id))?;

        let current: DeploymentState = row
            .get::<String, _>("state")
            .parse()
            .map_err(DeployError::Serialisation)?;

        if !current.can_transition(DeploymentState::Deployed) {
            return Err(DeployError::InvalidStateTransition {
                from: current.as_str(),
                to: DeploymentState::Deployed.as_str(),
            });
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET state = $2, error_message = NULL,
                deployed_at = COALESCE(deployed_at, $3)
            WHERE id = $1
            "#,
        )
        .bind(deployment_id)
        .bind(DeploymentState::Deployed.as_str())
        .bind(deployed_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE projects SET active_deployment_id = $2 WHERE id = $1")
            .bind(project_id)
            .bind(deployment_id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(DeployError::ProjectNotFound(project_id));
        }

        if max_deploys_kept > 0 {
            sqlx::query(
                r#"
                UPDATE deployments
                SET deleted_at = $3
                WHERE project_id = $1
                  AND state = $4
                  AND deleted_at IS NULL
                  AND id NOT IN (
                      SELECT id FROM deployments
                      WHERE project_id = $1 AND state = $4 AND deleted_at IS NULL
                      ORDER BY id DESC
                      LIMIT $2
                  )
                "#,
            )
            .bind(project_id)
            .bind(max_deploys_kept)
            .bind(deployed_at)
            .bind(DeploymentState::Deployed.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(deployed_at)
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    async fn create_project(store: &PostgresStore, name: &str) -> i64 {
        let unique_name = format!("{name}-{}", uuid::Uuid::new_v4().simple());
        sqlx::query(
            "INSERT INTO projects (name, user_id, watermark, force_https) \
             VALUES ($1, 1, FALSE, FALSE) RETURNING id",
        )
        .bind(&unique_name)
        .fetch_one(&store.pool)
        .await
        .expect("project insert failed")
        .get("id")
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn insert_and_finalize() {
        let url = database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let project_id = create_project(&store, "pg-store-test").await;

        let deployment = store
            .insert_deployment(NewDeployment::new(project_id, 1))
            .await
            .expect("insert failed");
        assert_eq!(deployment.state, DeploymentState::PendingDeploy);
        assert_eq!(deployment.version, 1);

        let deployed_at = store
            .finalize_deploy(deployment.id, project_id, 0)
            .await
            .expect("finalize failed");

        let stored = store
            .find_deployment(deployment.id)
            .await
            .expect("find failed")
            .expect("deployment should exist");
        assert_eq!(stored.state, DeploymentState::Deployed);
        assert_eq!(stored.deployed_at.map(|t| t.timestamp()), Some(deployed_at.timestamp()));

        let project = store
            .find_project(project_id)
            .await
            .expect("find project failed")
            .expect("project should exist");
        assert_eq!(project.active_deployment_id, Some(deployment.id));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn update_state_enforces_transitions() {
        let url = database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let project_id = create_project(&store, "pg-transition-test").await;
        let deployment = store
            .insert_deployment(NewDeployment::new(project_id, 1))
            .await
            .expect("insert failed");

        let err = store
            .update_state(deployment.id, DeploymentState::Uploaded, None)
            .await
            .expect_err("transition should be rejected");
        assert!(matches!(err, DeployError::InvalidStateTransition { .. }));

        store
            .update_state(deployment.id, DeploymentState::DeployFailed, Some("boom"))
            .await
            .expect("legal transition failed");
    }
}
