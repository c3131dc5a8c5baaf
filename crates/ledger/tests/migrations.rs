use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("PODTRACK_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

async fn scratch_schema(db_url: &str) -> (sqlx::PgPool, String) {
    let schema = format!("podtrack_test_{}", ulid::Ulid::new()).to_lowercase();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    (pool, schema)
}

async fn drop_schema(pool: sqlx::PgPool, schema: &str) {
    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_make_transactions_append_only() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set PODTRACK_TEST_DB_URL to enable");
        return;
    };

    let (pool, schema) = scratch_schema(&db_url).await;

    let set_search_path = format!("SET search_path TO {}", schema);
    sqlx::query(&set_search_path)
        .execute(&pool)
        .await
        .expect("set search_path should succeed");

    podtrack_ledger::migrate(&pool)
        .await
        .expect("migrations should apply");
    podtrack_ledger::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    sqlx::query(
        "INSERT INTO transactions (id, entity_type, entity_id, action, details, details_hash, created_by_id) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind("tx1")
    .bind("Pod")
    .bind("POD-1")
    .bind("CREATE")
    .bind(serde_json::json!({"k": "v"}))
    .bind("cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc")
    .bind("u1")
    .execute(&pool)
    .await
    .expect("insert transaction should succeed");

    let update_err = sqlx::query("UPDATE transactions SET action = 'EDITED' WHERE id = $1")
        .bind("tx1")
        .execute(&pool)
        .await
        .expect_err("update must be rejected for the audit table");
    assert!(
        format!("{update_err:?}").contains("append-only table"),
        "expected append-only error for update, got: {update_err:?}"
    );

    let delete_err = sqlx::query("DELETE FROM transactions WHERE id = $1")
        .bind("tx1")
        .execute(&pool)
        .await
        .expect_err("delete must be rejected for the audit table");
    assert!(
        format!("{delete_err:?}").contains("append-only table"),
        "expected append-only error for delete, got: {delete_err:?}"
    );

    let truncate_err = sqlx::query("TRUNCATE transactions")
        .execute(&pool)
        .await
        .expect_err("truncate must be rejected for the audit table");
    assert!(format!("{truncate_err:?}").contains("append-only table"));

    let self_merge = sqlx::query(
        "INSERT INTO users (id, email, role, merged_into_user_id) VALUES ('u9', 'x@example.com', 'REGULAR', 'u9')",
    )
    .execute(&pool)
    .await;
    assert!(self_merge.is_err(), "an identity must not merge into itself");

    drop_schema(pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recorded_details_hash_verifies_and_history_is_ordered() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping ledger integrity test; set PODTRACK_TEST_DB_URL to enable");
        return;
    };

    let (pool, schema) = scratch_schema(&db_url).await;
    let schema_url = schema_db_url(&db_url, &schema);

    let ledger = podtrack_ledger::AuditLedger::connect_and_migrate(
        &schema_url,
        std::time::Duration::from_millis(500),
    )
    .await
    .expect("ledger init should succeed");

    let first_details = serde_json::json!({
        "k": "v",
        "obj": {"a": "b", "c": "d"},
        "arr": ["x", "y"]
    });
    let second_details = serde_json::json!({"changes": {"status": ["open", "closed"]}});

    let first = ledger
        .record(podtrack_ledger::AuditRecord {
            entity_type: "Pod",
            entity_id: "POD-1",
            action: "CREATE",
            details: &first_details,
            actor_id: "u1",
        })
        .await
        .expect("record should succeed");
    let second = ledger
        .record(podtrack_ledger::AuditRecord {
            entity_type: "Pod",
            entity_id: "POD-1",
            action: "UPDATE",
            details: &second_details,
            actor_id: "u2",
        })
        .await
        .expect("record should succeed");
    ledger
        .record(podtrack_ledger::AuditRecord {
            entity_type: "Pod",
            entity_id: "POD-2",
            action: "CREATE",
            details: &second_details,
            actor_id: "u2",
        })
        .await
        .expect("record should succeed");

    let row = sqlx::query("SELECT details, details_hash FROM transactions WHERE id = $1")
        .bind(&first.id)
        .fetch_one(ledger.pool())
        .await
        .expect("fetch transaction should succeed");

    let stored_details: serde_json::Value = row.try_get("details").expect("details should exist");
    let stored_hash: String = row
        .try_get("details_hash")
        .expect("details_hash should exist");

    let recomputed = podtrack_contracts::canonical::hash_canonical_json(&stored_details);
    assert_eq!(stored_hash, recomputed);
    assert_eq!(
        stored_hash,
        podtrack_contracts::canonical::hash_canonical_json(&first_details)
    );

    let history = ledger
        .list_for_entity("Pod", "POD-1")
        .await
        .expect("history should load");
    let ids = history.iter().map(|tx| tx.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    assert!(history.iter().all(podtrack_ledger::verify));
    assert_eq!(history[1].created_by_id, "u2");

    let blank = ledger
        .record(podtrack_ledger::AuditRecord {
            entity_type: "Pod",
            entity_id: " ",
            action: "UPDATE",
            details: &second_details,
            actor_id: "u2",
        })
        .await
        .expect_err("blank entity id must be rejected");
    assert!(matches!(blank, podtrack_ledger::LedgerError::InvalidRecord(_)));

    ledger.close().await;
    drop_schema(pool, &schema).await;
}
