//! PostgreSQL funding store implementation
//!
//! Every multi-row write runs in a `SERIALIZABLE` transaction and guards each
//! counterpart row with its expected balance, so a lost race surfaces as
//! [`StoreError::Conflict`] instead of a stale total.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::store::traits::{AllocationCommit, FundingStore, StoreError, StoreResult};
use crate::types::{Allocation, Donation, Entity, Fundable, FundableKind, Funding, Project};

const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS charity_project_id_seq;
CREATE SEQUENCE IF NOT EXISTS donation_id_seq;

CREATE TABLE IF NOT EXISTS charity_project (
    id              BIGINT PRIMARY KEY,
    name            VARCHAR(100) NOT NULL UNIQUE,
    description     TEXT NOT NULL,
    full_amount     BIGINT NOT NULL CHECK (full_amount > 0),
    invested_amount BIGINT NOT NULL DEFAULT 0
                    CHECK (invested_amount >= 0 AND invested_amount <= full_amount),
    fully_invested  BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL,
    closed_at       TIMESTAMPTZ,
    CHECK (fully_invested = (invested_amount = full_amount)),
    CHECK ((closed_at IS NOT NULL) = fully_invested)
);

CREATE TABLE IF NOT EXISTS donation (
    id              BIGINT PRIMARY KEY,
    donor_id        UUID NOT NULL,
    comment         TEXT,
    full_amount     BIGINT NOT NULL CHECK (full_amount > 0),
    invested_amount BIGINT NOT NULL DEFAULT 0
                    CHECK (invested_amount >= 0 AND invested_amount <= full_amount),
    fully_invested  BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL,
    closed_at       TIMESTAMPTZ,
    CHECK (fully_invested = (invested_amount = full_amount)),
    CHECK ((closed_at IS NOT NULL) = fully_invested)
);

CREATE TABLE IF NOT EXISTS allocation (
    id           BIGSERIAL PRIMARY KEY,
    donation_id  BIGINT NOT NULL REFERENCES donation (id),
    project_id   BIGINT NOT NULL REFERENCES charity_project (id),
    amount       BIGINT NOT NULL CHECK (amount > 0),
    allocated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS charity_project_open_idx
    ON charity_project (created_at, id) WHERE NOT fully_invested;
CREATE INDEX IF NOT EXISTS donation_open_idx
    ON donation (created_at, id) WHERE NOT fully_invested;
CREATE INDEX IF NOT EXISTS donation_donor_idx ON donation (donor_id);
"#;

const DONATION_COLUMNS: &str =
    "id, donor_id, comment, full_amount, invested_amount, fully_invested, created_at, closed_at";
const PROJECT_COLUMNS: &str =
    "id, name, description, full_amount, invested_amount, fully_invested, created_at, closed_at";

/// PostgreSQL funding store
pub struct PostgresFundingStore {
    pool: Arc<PgPool>,
}

impl PostgresFundingStore {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `url` and make sure the schema exists
    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await
            .map_err(map_sqlx)?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables, sequences and indexes if missing
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        tracing::info!("Funding schema ensured");
        Ok(())
    }

    async fn begin_serializable(&self) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(tx)
    }

    fn table(kind: FundableKind) -> &'static str {
        match kind {
            FundableKind::Donation => "donation",
            FundableKind::Project => "charity_project",
        }
    }

    fn columns(kind: FundableKind) -> &'static str {
        match kind {
            FundableKind::Donation => DONATION_COLUMNS,
            FundableKind::Project => PROJECT_COLUMNS,
        }
    }
}

/// Map driver errors onto store errors
///
/// SQLSTATE 40001/40P01 are serialization failures and deadlocks, 23505 is a
/// unique violation (the only unique column is the project name).
fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        match db.code().as_deref() {
            Some("40001") | Some("40P01") => {
                return StoreError::Conflict(db.message().to_string())
            }
            Some("23505") => return StoreError::Duplicate(db.message().to_string()),
            _ => {}
        }
    }
    StoreError::Backend(err.to_string())
}

fn to_db_amount(amount: u64) -> StoreResult<i64> {
    i64::try_from(amount).map_err(|_| StoreError::Backend(format!("amount {} out of range", amount)))
}

fn from_db_amount(amount: i64) -> StoreResult<u64> {
    u64::try_from(amount).map_err(|_| StoreError::Backend(format!("negative amount {} in storage", amount)))
}

fn row_to_funding(row: &PgRow) -> StoreResult<Funding> {
    Ok(Funding {
        full_amount: from_db_amount(row.try_get("full_amount").map_err(map_sqlx)?)?,
        invested_amount: from_db_amount(row.try_get("invested_amount").map_err(map_sqlx)?)?,
        fully_invested: row.try_get("fully_invested").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        closed_at: row.try_get("closed_at").map_err(map_sqlx)?,
    })
}

fn row_to_donation(row: &PgRow) -> StoreResult<Donation> {
    Ok(Donation {
        id: row.try_get("id").map_err(map_sqlx)?,
        donor_id: row.try_get("donor_id").map_err(map_sqlx)?,
        comment: row.try_get("comment").map_err(map_sqlx)?,
        funding: row_to_funding(row)?,
    })
}

fn row_to_project(row: &PgRow) -> StoreResult<Project> {
    Ok(Project {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        funding: row_to_funding(row)?,
    })
}

fn row_to_entity(kind: FundableKind, row: &PgRow) -> StoreResult<Entity> {
    match kind {
        FundableKind::Donation => row_to_donation(row).map(Entity::from),
        FundableKind::Project => row_to_project(row).map(Entity::from),
    }
}

fn row_to_allocation(row: &PgRow) -> StoreResult<Allocation> {
    Ok(Allocation {
        donation_id: row.try_get("donation_id").map_err(map_sqlx)?,
        project_id: row.try_get("project_id").map_err(map_sqlx)?,
        amount: from_db_amount(row.try_get("amount").map_err(map_sqlx)?)?,
        allocated_at: row.try_get("allocated_at").map_err(map_sqlx)?,
    })
}

async fn insert_entity(tx: &mut Transaction<'static, Postgres>, entity: &Entity) -> StoreResult<()> {
    let funding = entity.funding();
    let query = match entity {
        Entity::Donation(d) => sqlx::query(
            r#"
            INSERT INTO donation (
                id, donor_id, comment, full_amount, invested_amount,
                fully_invested, created_at, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(d.id)
        .bind(d.donor_id)
        .bind(&d.comment),
        Entity::Project(p) => sqlx::query(
            r#"
            INSERT INTO charity_project (
                id, name, description, full_amount, invested_amount,
                fully_invested, created_at, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(&p.description),
    };

    query
        .bind(to_db_amount(funding.full_amount)?)
        .bind(to_db_amount(funding.invested_amount)?)
        .bind(funding.fully_invested)
        .bind(funding.created_at)
        .bind(funding.closed_at)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

#[async_trait]
impl FundingStore for PostgresFundingStore {
    async fn next_id(&self, kind: FundableKind) -> StoreResult<i64> {
        let row = sqlx::query(&format!("SELECT nextval('{}_id_seq') AS id", Self::table(kind)))
            .fetch_one(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_get("id").map_err(map_sqlx)
    }

    async fn get_by_id(&self, kind: FundableKind, id: i64) -> StoreResult<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::columns(kind),
            Self::table(kind)
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(|r| row_to_entity(kind, &r)).transpose()
    }

    async fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM charity_project WHERE name = $1",
            PROJECT_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(|r| row_to_project(&r)).transpose()
    }

    async fn list_open(&self, kind: FundableKind) -> StoreResult<Vec<Entity>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE NOT fully_invested ORDER BY created_at ASC, id ASC",
            Self::columns(kind),
            Self::table(kind)
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(|row| row_to_entity(kind, row)).collect()
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM charity_project ORDER BY created_at ASC, id ASC",
            PROJECT_COLUMNS
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_project).collect()
    }

    async fn list_donations(&self, donor_id: Option<Uuid>) -> StoreResult<Vec<Donation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM donation WHERE ($1::uuid IS NULL OR donor_id = $1) \
             ORDER BY created_at ASC, id ASC",
            DONATION_COLUMNS
        ))
        .bind(donor_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_donation).collect()
    }

    async fn list_allocations(&self, kind: FundableKind, id: i64) -> StoreResult<Vec<Allocation>> {
        let column = match kind {
            FundableKind::Donation => "donation_id",
            FundableKind::Project => "project_id",
        };
        let rows = sqlx::query(&format!(
            "SELECT donation_id, project_id, amount, allocated_at FROM allocation \
             WHERE {} = $1 ORDER BY id ASC",
            column
        ))
        .bind(id)
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_allocation).collect()
    }

    async fn commit_allocation(&self, commit: AllocationCommit) -> StoreResult<()> {
        let mut tx = self.begin_serializable().await?;

        insert_entity(&mut tx, &commit.subject)
            .await
            .map_err(|e| match (e, commit.subject.as_project()) {
                (StoreError::Duplicate(_), Some(project)) => StoreError::Duplicate(project.name.clone()),
                (other, _) => other,
            })?;

        for touched in &commit.touched {
            let (kind, id) = (touched.entity.kind(), touched.entity.id());
            let funding = touched.entity.funding();
            let result = sqlx::query(&format!(
                r#"
                UPDATE {} SET
                    invested_amount = $1,
                    fully_invested = $2,
                    closed_at = $3
                WHERE id = $4 AND invested_amount = $5 AND NOT fully_invested
                "#,
                Self::table(kind)
            ))
            .bind(to_db_amount(funding.invested_amount)?)
            .bind(funding.fully_invested)
            .bind(funding.closed_at)
            .bind(id)
            .bind(to_db_amount(touched.expected_invested)?)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() != 1 {
                // Dropping the transaction rolls back the subject insert too
                return Err(StoreError::Conflict(format!(
                    "{} {} changed: expected invested {}",
                    kind, id, touched.expected_invested
                )));
            }
        }

        for allocation in &commit.allocations {
            sqlx::query(
                r#"
                INSERT INTO allocation (donation_id, project_id, amount, allocated_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(allocation.donation_id)
            .bind(allocation.project_id)
            .bind(to_db_amount(allocation.amount)?)
            .bind(allocation.allocated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_project(&self, project: &Project, expected_invested: u64) -> StoreResult<()> {
        let mut tx = self.begin_serializable().await?;

        let result = sqlx::query(
            r#"
            UPDATE charity_project SET
                name = $1,
                description = $2,
                full_amount = $3,
                invested_amount = $4,
                fully_invested = $5,
                closed_at = $6
            WHERE id = $7 AND invested_amount = $8 AND NOT fully_invested
            "#,
        )
        .bind(&project.name)
        .bind(&project.description)
        .bind(to_db_amount(project.funding.full_amount)?)
        .bind(to_db_amount(project.funding.invested_amount)?)
        .bind(project.funding.fully_invested)
        .bind(project.funding.closed_at)
        .bind(project.id)
        .bind(to_db_amount(expected_invested)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx(e) {
            StoreError::Duplicate(_) => StoreError::Duplicate(project.name.clone()),
            other => other,
        })?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Conflict(format!(
                "project {} changed while being edited",
                project.id
            )));
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_project(&self, id: i64) -> StoreResult<Project> {
        let mut tx = self.begin_serializable().await?;

        let row = sqlx::query(&format!(
            "DELETE FROM charity_project WHERE id = $1 AND invested_amount = 0 \
             AND NOT fully_invested RETURNING {}",
            PROJECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let project = match row {
            Some(row) => row_to_project(&row)?,
            None => {
                return Err(StoreError::Conflict(format!(
                    "project {} missing or funded at delete time",
                    id
                )))
            }
        };

        tx.commit().await.map_err(map_sqlx)?;
        Ok(project)
    }
}
