use std::time::Duration;

use chrono::Utc;
use podtrack_contracts::{Actor, Identity, NO_PRIORITY, NewPod, Page, Pod, Role, Transaction};
use podtrack_ledger::{AuditLedger, AuditRecord};
use podtrack_policy::SearchPlan;
use podtrack_policy::facet::{self, FacetPlan};
use podtrack_policy::filter::{Condition, escape_like};
use podtrack_policy::pagination::{self, OrderKey};
use podtrack_policy::partition::Partition;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row};

use super::mutation::{self, PlannedWrite, PodChange};
use super::{Mutated, StoreError, audit_error};

const POD_COLUMNS: &str = "code, title, site, region, status, category, engineer_id, due_date, quantity, priority, is_history, is_deleted, should_display, created_by_id, created_at, completed_at";

const IDENTITY_COLUMNS: &str = "id, email, name, role, is_imported_profile, merged_into_user_id";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    ledger: AuditLedger,
    query_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Bind {
    Text(String),
    Int(i32),
    Bool(bool),
}

/// A rendered `WHERE` clause. Column names come only from the field
/// registry and flag table; every value travels as a bind parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WhereClause {
    sql: String,
    binds: Vec<Bind>,
}

fn render_where(conditions: &[Condition]) -> WhereClause {
    let mut parts = Vec::with_capacity(conditions.len());
    let mut binds = Vec::with_capacity(conditions.len());

    for condition in conditions {
        let n = binds.len() + 1;
        match condition {
            Condition::Contains { field, needle } => {
                parts.push(format!(
                    "{}::text ILIKE '%' || ${} || '%' ESCAPE '\\'",
                    field.column, n
                ));
                binds.push(Bind::Text(escape_like(needle)));
            }
            Condition::PriorityNotSentinel => {
                parts.push(format!("priority <> ${}", n));
                binds.push(Bind::Int(NO_PRIORITY));
            }
            Condition::PriorityBelowSentinel => {
                parts.push(format!("priority < ${}", n));
                binds.push(Bind::Int(NO_PRIORITY));
            }
            Condition::Flag { flag, value } => {
                parts.push(format!("{} = ${}", flag.column(), n));
                binds.push(Bind::Bool(*value));
            }
        }
    }

    let sql = if parts.is_empty() {
        "TRUE".to_string()
    } else {
        parts.join(" AND ")
    };
    WhereClause { sql, binds }
}

fn render_order_by(partition: Partition) -> String {
    pagination::order_keys(partition)
        .iter()
        .map(|key| match key {
            OrderKey::PriorityAssignedFirst => format!("(priority = {}) ASC", NO_PRIORITY),
            OrderKey::PriorityAsc => "priority ASC".to_string(),
            OrderKey::CreatedAtDesc => "created_at DESC".to_string(),
            OrderKey::CompletedAtDescNullsLast => "completed_at DESC NULLS LAST".to_string(),
            OrderKey::CodeAsc => "code ASC".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [Bind],
) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value.as_str()),
            Bind::Int(value) => query.bind(*value),
            Bind::Bool(value) => query.bind(*value),
        };
    }
    query
}

fn pod_from_row(row: &PgRow) -> Result<Pod, sqlx::Error> {
    Ok(Pod {
        code: row.try_get("code")?,
        title: row.try_get("title")?,
        site: row.try_get("site")?,
        region: row.try_get("region")?,
        status: row.try_get("status")?,
        category: row.try_get("category")?,
        engineer_id: row.try_get("engineer_id")?,
        due_date: row.try_get("due_date")?,
        quantity: row.try_get("quantity")?,
        priority: row.try_get("priority")?,
        is_history: row.try_get("is_history")?,
        is_deleted: row.try_get("is_deleted")?,
        should_display: row.try_get("should_display")?,
        created_by_id: row.try_get("created_by_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn identity_from_row(row: &PgRow) -> Result<Identity, StoreError> {
    let raw_role: String = row.try_get("role").map_err(backend)?;
    let role = Role::parse(&raw_role)
        .ok_or_else(|| StoreError::Backend(format!("unknown role `{}` in users", raw_role)))?;

    Ok(Identity {
        id: row.try_get("id").map_err(backend)?,
        email: row.try_get("email").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        role,
        is_imported_profile: row.try_get("is_imported_profile").map_err(backend)?,
        merged_into_user_id: row.try_get("merged_into_user_id").map_err(backend)?,
    })
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Constraint violations raised by the entity write are caller mistakes;
/// anything else is a backend failure.
fn write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => {
                return StoreError::InvalidPayload("pod code already exists".to_string());
            }
            Some("23503") => {
                return StoreError::InvalidPayload("unknown identity reference".to_string());
            }
            _ => {}
        }
    }
    backend(err)
}

async fn set_statement_timeout(
    conn: &mut PgConnection,
    timeout: Duration,
) -> Result<(), StoreError> {
    let timeout_str = format!("{}ms", timeout.as_millis());
    sqlx::query("SELECT set_config('statement_timeout', $1, true)")
        .bind(&timeout_str)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(())
}

impl PgStore {
    pub async fn connect(
        db_url: &str,
        query_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let ledger = AuditLedger::connect_and_migrate(db_url, write_timeout)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self::from_ledger(ledger, query_timeout))
    }

    pub fn from_ledger(ledger: AuditLedger, query_timeout: Duration) -> Self {
        Self {
            pool: ledger.pool().clone(),
            ledger,
            query_timeout,
        }
    }

    pub(super) async fn ping(&self) -> Result<(), StoreError> {
        self.ledger
            .ping()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    pub(super) async fn search(&self, plan: &SearchPlan) -> Result<Page<Pod>, StoreError> {
        let clause = render_where(plan.predicate.conditions());
        let order_by = render_order_by(plan.partition());
        let count_sql = format!("SELECT COUNT(*) AS total FROM pods WHERE {}", clause.sql);
        let limit_n = clause.binds.len() + 1;
        let rows_sql = format!(
            "SELECT {} FROM pods WHERE {} ORDER BY {} LIMIT ${} OFFSET ${}",
            POD_COLUMNS,
            clause.sql,
            order_by,
            limit_n,
            limit_n + 1
        );
        let limit = i64::try_from(plan.page.page_size()).unwrap_or(i64::MAX);
        let offset = i64::try_from(plan.page.offset()).unwrap_or(i64::MAX);

        let (total, rows) = tokio::time::timeout(self.query_timeout, async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            set_statement_timeout(&mut *tx, self.query_timeout).await?;

            let total: i64 = bind_all(sqlx::query(&count_sql), &clause.binds)
                .fetch_one(&mut *tx)
                .await
                .and_then(|row| row.try_get("total"))
                .map_err(backend)?;

            let rows = bind_all(sqlx::query(&rows_sql), &clause.binds)
                .bind(limit)
                .bind(offset)
                .fetch_all(&mut *tx)
                .await
                .map_err(backend)?;

            tx.commit().await.map_err(backend)?;
            Ok::<_, StoreError>((total, rows))
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        let pods = rows
            .iter()
            .map(pod_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        Ok(plan
            .page
            .into_page(pods, u64::try_from(total).unwrap_or(0)))
    }

    pub(super) async fn facet_values(&self, plan: &FacetPlan) -> Result<Vec<String>, StoreError> {
        let clause = render_where(plan.predicate.conditions());
        let sql = format!(
            "SELECT DISTINCT {}::text AS value FROM pods WHERE {}",
            plan.field.column, clause.sql
        );

        let rows = tokio::time::timeout(self.query_timeout, async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            set_statement_timeout(&mut *tx, self.query_timeout).await?;
            let rows = bind_all(sqlx::query(&sql), &clause.binds)
                .fetch_all(&mut *tx)
                .await
                .map_err(backend)?;
            tx.commit().await.map_err(backend)?;
            Ok::<_, StoreError>(rows)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        let values = rows
            .iter()
            .map(|row| row.try_get::<Option<String>, _>("value"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        Ok(facet::normalize_values(values))
    }

    pub(super) async fn pod(&self, code: &str) -> Result<Option<Pod>, StoreError> {
        let sql = format!("SELECT {} FROM pods WHERE code = $1", POD_COLUMNS);
        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(&sql).bind(code).fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(backend)?;

        row.as_ref()
            .map(pod_from_row)
            .transpose()
            .map_err(backend)
    }

    pub(super) async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM users ORDER BY created_at ASC, id ASC",
            IDENTITY_COLUMNS
        );
        let rows = tokio::time::timeout(self.query_timeout, sqlx::query(&sql).fetch_all(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(backend)?;

        rows.iter().map(identity_from_row).collect()
    }

    pub(super) async fn create_pod(
        &self,
        actor: &Actor,
        new_pod: NewPod,
    ) -> Result<Mutated<Pod>, StoreError> {
        let planned = mutation::plan_create(actor, new_pod, Utc::now())?;
        let insert_sql = format!(
            "INSERT INTO pods ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            POD_COLUMNS
        );

        tokio::time::timeout(self.ledger.write_timeout(), async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            let audit = podtrack_ledger::append(&mut *tx, &planned.audit_record(actor))
                .await
                .map_err(audit_error)?;

            let pod = &planned.next;
            sqlx::query(&insert_sql)
                .bind(&pod.code)
                .bind(&pod.title)
                .bind(&pod.site)
                .bind(&pod.region)
                .bind(&pod.status)
                .bind(&pod.category)
                .bind(&pod.engineer_id)
                .bind(pod.due_date)
                .bind(pod.quantity)
                .bind(pod.priority)
                .bind(pod.is_history)
                .bind(pod.is_deleted)
                .bind(pod.should_display)
                .bind(&pod.created_by_id)
                .bind(pod.created_at)
                .bind(pod.completed_at)
                .execute(&mut *tx)
                .await
                .map_err(write_error)?;

            tx.commit().await.map_err(backend)?;
            Ok::<_, StoreError>(audit)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
        .map(|audit| Mutated {
            entity: planned.next,
            audit,
        })
    }

    pub(super) async fn change_pod(
        &self,
        actor: &Actor,
        code: &str,
        change: &PodChange,
    ) -> Result<Mutated<Pod>, StoreError> {
        let select_sql = format!("SELECT {} FROM pods WHERE code = $1 FOR UPDATE", POD_COLUMNS);

        tokio::time::timeout(self.ledger.write_timeout(), async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            let current = sqlx::query(&select_sql)
                .bind(code)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?
                .map(|row| pod_from_row(&row))
                .transpose()
                .map_err(backend)?;

            let planned = mutation::plan_change(actor, code, current, change, Utc::now())?;
            let audit = podtrack_ledger::append(&mut *tx, &planned.audit_record(actor))
                .await
                .map_err(audit_error)?;

            let PlannedWrite { next, .. } = planned;
            sqlx::query(
                "UPDATE pods SET title = $2, site = $3, region = $4, status = $5, category = $6, engineer_id = $7, due_date = $8, quantity = $9, priority = $10, is_history = $11, is_deleted = $12, completed_at = $13 WHERE code = $1",
            )
            .bind(&next.code)
            .bind(&next.title)
            .bind(&next.site)
            .bind(&next.region)
            .bind(&next.status)
            .bind(&next.category)
            .bind(&next.engineer_id)
            .bind(next.due_date)
            .bind(next.quantity)
            .bind(next.priority)
            .bind(next.is_history)
            .bind(next.is_deleted)
            .bind(next.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

            tx.commit().await.map_err(backend)?;
            Ok::<_, StoreError>(Mutated {
                entity: next,
                audit,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    pub(super) async fn merge_identity(
        &self,
        actor: &Actor,
        source_id: &str,
        target_id: &str,
    ) -> Result<Mutated<Identity>, StoreError> {
        let select_sql = format!(
            "SELECT {} FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            IDENTITY_COLUMNS
        );

        tokio::time::timeout(self.ledger.write_timeout(), async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            let ids = vec![source_id.to_string(), target_id.to_string()];
            let rows = sqlx::query(&select_sql)
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await
                .map_err(backend)?;
            let found = rows
                .iter()
                .map(identity_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            let pick = |id: &str| found.iter().find(|identity| identity.id == id).cloned();

            let planned =
                mutation::plan_merge(source_id, target_id, pick(source_id), pick(target_id))?;
            let audit = podtrack_ledger::append(&mut *tx, &planned.audit_record(actor))
                .await
                .map_err(audit_error)?;

            let PlannedWrite { next, .. } = planned;
            sqlx::query("UPDATE users SET merged_into_user_id = $2 WHERE id = $1")
                .bind(&next.id)
                .bind(&next.merged_into_user_id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            tx.commit().await.map_err(backend)?;
            Ok::<_, StoreError>(Mutated {
                entity: next,
                audit,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    pub(super) async fn record_audit(
        &self,
        record: AuditRecord<'_>,
    ) -> Result<Transaction, StoreError> {
        self.ledger.record(record).await.map_err(audit_error)
    }

    pub(super) async fn audit_trail(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.ledger
            .list_for_entity(entity_type, entity_id)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtrack_contracts::Criterion;
    use podtrack_policy::filter::{self, FilterPath};
    use podtrack_policy::pagination::PageDefaults;
    use podtrack_policy::{SearchInput, plan_search};

    fn criterion(field: &str, value: &str) -> Criterion {
        Criterion {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn where_clause_binds_every_value() {
        let criteria = vec![
            criterion("title", "50%_off"),
            criterion("priority", "has_value"),
        ];
        let plan = plan_search(
            SearchInput {
                role: Role::Priority,
                is_history: false,
                page: None,
                page_size: None,
                criteria: &criteria,
            },
            PageDefaults::default(),
        )
        .expect("plan should build");

        let clause = render_where(plan.predicate.conditions());
        assert_eq!(
            clause.sql,
            "is_deleted = $1 AND is_history = $2 AND title::text ILIKE '%' || $3 || '%' ESCAPE '\\' AND priority <> $4 AND should_display = $5"
        );
        assert_eq!(
            clause.binds,
            vec![
                Bind::Bool(false),
                Bind::Bool(false),
                Bind::Text("50\\%\\_off".to_string()),
                Bind::Int(NO_PRIORITY),
                Bind::Bool(false),
            ]
        );
    }

    #[test]
    fn facet_priority_criterion_renders_below_sentinel() {
        let criteria = vec![criterion("priority", "3")];
        let predicate = filter::build(&criteria, Partition::History, FilterPath::Facet)
            .expect("predicate should build");
        let clause = render_where(predicate.conditions());
        assert!(clause.sql.ends_with("priority < $3"));
        assert_eq!(clause.binds[1], Bind::Bool(true));
        assert!(!clause.sql.contains("should_display"));
    }

    #[test]
    fn order_by_matches_partition() {
        assert_eq!(
            render_order_by(Partition::Active),
            "(priority = 9999) ASC, priority ASC, created_at DESC, code ASC"
        );
        assert_eq!(
            render_order_by(Partition::History),
            "completed_at DESC NULLS LAST, created_at DESC, code ASC"
        );
    }
}
