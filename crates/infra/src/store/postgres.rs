//! Postgres-backed ledger store.
//!
//! Each [`LedgerTx`] is one SQL transaction. Rows a transaction will mutate
//! are read with `SELECT ... FOR UPDATE ORDER BY id`, so concurrent writers
//! queue on the same rows in the same order instead of deadlocking, and
//! `SET LOCAL lock_timeout` turns a long wait into an error.
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | meaning | `DomainError` |
//! |---|---|---|
//! | `55P03` | lock not available (lock_timeout) | `Conflict { retryable: true }` |
//! | `40001` | serialization failure | `Conflict { retryable: true }` |
//! | `40P01` | deadlock detected | `Conflict { retryable: true }` |
//! | `23505` | unique violation | `Conflict { retryable: false }` |
//! | `23514` | check violation | `Storage` |
//! | anything else | | `Storage` |
//!
//! Dropping an uncommitted `sqlx::Transaction` issues a rollback, so an
//! abandoned `PgLedgerTx` never leaves partial writes behind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use pharmastock_core::{
    BatchId, CategoryId, DomainError, DomainResult, Entity, InvoiceId, LineId, ProductId, SaleId,
    SupplierId, UserId,
};
use pharmastock_events::{Event, EventEnvelope};
use pharmastock_inventory::{
    BATCH_STREAM, Batch, BatchParts, BatchState, BatchStatus, LotSpec, StockMovement, WarehouseQuery,
};
use pharmastock_products::{Product, ProductParts, ProductStatus};
use pharmastock_purchasing::{InvoiceHeader, InvoiceLine, InvoiceParts, PurchaseInvoice};
use pharmastock_sales::{PaymentMethod, SaleLineItem, SaleTransaction};

use super::r#trait::{InventoryStore, LedgerTx};

/// DDL applied by [`PostgresInventoryStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS purchase_invoices (
        id UUID PRIMARY KEY,
        invoice_number TEXT NOT NULL UNIQUE,
        supplier_id UUID NULL,
        invoice_date DATE NOT NULL,
        due_date DATE NULL,
        payment_date DATE NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_lines (
        line_id UUID PRIMARY KEY,
        invoice_id UUID NOT NULL REFERENCES purchase_invoices(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        product_name TEXT NOT NULL,
        packaging_unit TEXT NOT NULL,
        unit_cost BIGINT NOT NULL CHECK (unit_cost > 0),
        expiry_date DATE NULL,
        quantity BIGINT NOT NULL CHECK (quantity > 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        selling_price BIGINT NOT NULL CHECK (selling_price >= 0),
        margin_percent DOUBLE PRECISION NULL,
        category_id UUID NULL,
        image_path TEXT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batches (
        id UUID PRIMARY KEY,
        invoice_id UUID NOT NULL REFERENCES purchase_invoices(id),
        line_id UUID NOT NULL,
        product_name TEXT NOT NULL,
        packaging_unit TEXT NOT NULL,
        unit_cost BIGINT NOT NULL,
        expiry_date DATE NULL,
        remaining_quantity BIGINT NOT NULL CHECK (remaining_quantity >= 0),
        status TEXT NOT NULL,
        product_id UUID NULL REFERENCES products(id),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS batches_product_idx ON batches (product_id)",
    "CREATE INDEX IF NOT EXISTS batches_line_idx ON batches (invoice_id, line_id)",
    "CREATE INDEX IF NOT EXISTS batches_warehouse_idx ON batches (product_name) WHERE status = 'unallocated'",
    r#"
    CREATE TABLE IF NOT EXISTS sales (
        id UUID PRIMARY KEY,
        cashier_id UUID NOT NULL,
        payment_method TEXT NOT NULL,
        total_price BIGINT NOT NULL,
        amount_paid BIGINT NOT NULL,
        change_due BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sale_lines (
        sale_id UUID NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        product_id UUID NOT NULL,
        quantity BIGINT NOT NULL CHECK (quantity > 0),
        price_at_sale BIGINT NOT NULL,
        PRIMARY KEY (sale_id, position)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sale_lines_product_idx ON sale_lines (product_id)",
    r#"
    CREATE TABLE IF NOT EXISTS stock_movements (
        event_id UUID PRIMARY KEY,
        batch_id UUID NOT NULL,
        sequence_number BIGINT NOT NULL,
        event_type TEXT NOT NULL,
        event_version INTEGER NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        UNIQUE (batch_id, sequence_number)
    )
    "#,
];

const BATCH_COLUMNS: &str = "id, invoice_id, line_id, product_name, packaging_unit, unit_cost, \
     expiry_date, remaining_quantity, status, product_id, created_at, updated_at";

const PRODUCT_COLUMNS: &str = "id, name, selling_price, margin_percent, category_id, image_path, \
     status, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, invoice_number, supplier_id, invoice_date, due_date, \
     payment_date, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    /// Create tables and indexes that do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> DomainResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch_batches(&self, sql: &str, bind: Option<Uuid>) -> DomainResult<Vec<Batch>> {
        let mut query = sqlx::query(sql);
        if let Some(id) = bind {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(skip(self), fields(lock_timeout_ms = self.lock_timeout.as_millis() as u64), err)]
    async fn begin(&self) -> DomainResult<Box<dyn LedgerTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we format ourselves.
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn batch(&self, id: BatchId) -> DomainResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1");
        Ok(self
            .fetch_batches(&sql, Some(*id.as_uuid()))
            .await?
            .into_iter()
            .next())
    }

    async fn product_batches(&self, product_id: ProductId) -> DomainResult<Vec<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE product_id = $1 ORDER BY id");
        self.fetch_batches(&sql, Some(*product_id.as_uuid())).await
    }

    async fn warehouse_batches(&self) -> DomainResult<Vec<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE status = 'unallocated' ORDER BY id");
        self.fetch_batches(&sql, None).await
    }

    async fn expiring_batches(&self, cutoff: NaiveDate) -> DomainResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE status <> 'depleted' AND expiry_date IS NOT NULL AND expiry_date <= $1 \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expiring_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn invoice_batches(&self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE invoice_id = $1 ORDER BY id");
        self.fetch_batches(&sql, Some(*invoice_id.as_uuid())).await
    }

    async fn product(&self, id: ProductId) -> DomainResult<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn invoice(&self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_invoice(&mut conn, id, false).await
    }

    async fn sale(&self, id: SaleId) -> DomainResult<Option<SaleTransaction>> {
        let Some(row) = sqlx::query(
            "SELECT id, cashier_id, payment_method, total_price, amount_paid, change_due, created_at \
             FROM sales WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sale", e))?
        else {
            return Ok(None);
        };

        let lines = sqlx::query(
            "SELECT product_id, quantity, price_at_sale FROM sale_lines WHERE sale_id = $1 ORDER BY position",
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sale_lines", e))?
        .iter()
        .map(|r| -> Result<SaleLineItem, sqlx::Error> {
            Ok(SaleLineItem {
                product_id: ProductId::from_uuid(r.try_get("product_id")?),
                quantity: r.try_get("quantity")?,
                price_at_sale: r.try_get("price_at_sale")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| decode_error("sale_lines", e))?;

        let method: String = row.try_get("payment_method").map_err(|e| decode_error("sales", e))?;
        Ok(Some(SaleTransaction::restore(
            SaleId::from_uuid(row.try_get("id").map_err(|e| decode_error("sales", e))?),
            UserId::from_uuid(row.try_get("cashier_id").map_err(|e| decode_error("sales", e))?),
            PaymentMethod::parse(&method).map_err(|e| DomainError::storage(e.to_string()))?,
            row.try_get("total_price").map_err(|e| decode_error("sales", e))?,
            row.try_get("amount_paid").map_err(|e| decode_error("sales", e))?,
            row.try_get("change_due").map_err(|e| decode_error("sales", e))?,
            lines,
            row.try_get("created_at").map_err(|e| decode_error("sales", e))?,
        )))
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn movements(&self, batch_id: BatchId) -> DomainResult<Vec<EventEnvelope<StockMovement>>> {
        let rows = sqlx::query(
            "SELECT event_id, batch_id, sequence_number, event_type, occurred_at, payload \
             FROM stock_movements WHERE batch_id = $1 ORDER BY sequence_number ASC",
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;

        let mut journal = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |e| decode_error("stock_movements", e);
            let payload: serde_json::Value = row.try_get("payload").map_err(decode)?;
            let movement: StockMovement = serde_json::from_value(payload)
                .map_err(|e| DomainError::storage(format!("undecodable stock movement: {e}")))?;
            let sequence_number: i64 = row.try_get("sequence_number").map_err(decode)?;
            journal.push(EventEnvelope::from_parts(
                row.try_get("event_id").map_err(decode)?,
                row.try_get("batch_id").map_err(decode)?,
                BATCH_STREAM,
                sequence_number as u64,
                row.try_get::<String, _>("event_type").map_err(decode)?,
                row.try_get::<DateTime<Utc>, _>("occurred_at").map_err(decode)?,
                movement,
            ));
        }
        Ok(journal)
    }
}

/// A store transaction over one pooled connection.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn locked_batches(&mut self, filter: &str, binds: &[Uuid]) -> DomainResult<Vec<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE {filter} ORDER BY id FOR UPDATE");
        let mut query = sqlx::query(&sql);
        for id in binds {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn write_invoice_lines(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()> {
        sqlx::query("DELETE FROM invoice_lines WHERE invoice_id = $1")
            .bind(invoice.id().as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("clear_invoice_lines", e))?;

        for (position, line) in invoice.lines().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (
                    line_id, invoice_id, position, product_name, packaging_unit,
                    unit_cost, expiry_date, quantity
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(line.line_id.as_uuid())
            .bind(invoice.id().as_uuid())
            .bind(position as i32)
            .bind(&line.lot.product_name)
            .bind(&line.lot.packaging_unit)
            .bind(line.lot.unit_cost)
            .bind(line.lot.expiry_date)
            .bind(line.quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_invoice_line", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_batch(&mut self, id: BatchId) -> DomainResult<Option<Batch>> {
        Ok(self
            .locked_batches("id = $1", &[*id.as_uuid()])
            .await?
            .into_iter()
            .next())
    }

    async fn lock_product_batches(&mut self, product_id: ProductId) -> DomainResult<Vec<Batch>> {
        self.locked_batches("product_id = $1", &[*product_id.as_uuid()]).await
    }

    async fn lock_line_batches(&mut self, invoice_id: InvoiceId, line_id: LineId) -> DomainResult<Vec<Batch>> {
        self.locked_batches(
            "invoice_id = $1 AND line_id = $2",
            &[*invoice_id.as_uuid(), *line_id.as_uuid()],
        )
        .await
    }

    async fn lock_invoice_batches(&mut self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>> {
        self.locked_batches("invoice_id = $1", &[*invoice_id.as_uuid()]).await
    }

    async fn lock_warehouse_candidates(&mut self, query: &WarehouseQuery) -> DomainResult<Vec<Batch>> {
        let key = query.key.as_ref();
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE status = 'unallocated' AND product_name = $1 AND remaining_quantity >= $2 \
               AND ($3::uuid IS NULL OR ( \
                    invoice_id = $3 AND line_id = $4 AND packaging_unit = $5 \
                    AND unit_cost = $6 AND expiry_date IS NOT DISTINCT FROM $7)) \
             ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(&query.product_name)
            .bind(query.min_quantity)
            .bind(key.map(|k| *k.invoice_id.as_uuid()))
            .bind(key.map(|k| *k.line_id.as_uuid()))
            .bind(key.map(|k| k.packaging_unit.clone()))
            .bind(key.map(|k| k.unit_cost))
            .bind(key.and_then(|k| k.expiry_date))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_warehouse_candidates", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn insert_batch(&mut self, batch: &Batch) -> DomainResult<()> {
        let lot = batch.lot();
        sqlx::query(
            r#"
            INSERT INTO batches (
                id, invoice_id, line_id, product_name, packaging_unit, unit_cost,
                expiry_date, remaining_quantity, status, product_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(batch.id().as_uuid())
        .bind(batch.invoice_id().as_uuid())
        .bind(batch.line_id().as_uuid())
        .bind(&lot.product_name)
        .bind(&lot.packaging_unit)
        .bind(lot.unit_cost)
        .bind(lot.expiry_date)
        .bind(batch.remaining_quantity())
        .bind(batch.status().as_str())
        .bind(batch.linked_product_id().map(|p| *p.as_uuid()))
        .bind(batch.created_at())
        .bind(batch.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;
        Ok(())
    }

    async fn update_batch(&mut self, batch: &Batch) -> DomainResult<()> {
        let lot = batch.lot();
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET product_name = $2, packaging_unit = $3, unit_cost = $4, expiry_date = $5,
                remaining_quantity = $6, status = $7, product_id = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(batch.id().as_uuid())
        .bind(&lot.product_name)
        .bind(&lot.packaging_unit)
        .bind(lot.unit_cost)
        .bind(lot.expiry_date)
        .bind(batch.remaining_quantity())
        .bind(batch.status().as_str())
        .bind(batch.linked_product_id().map(|p| *p.as_uuid()))
        .bind(batch.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_batch", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("batch", batch.id()));
        }
        Ok(())
    }

    async fn delete_batch(&mut self, id: BatchId) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM batches WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_batch", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("batch", id));
        }
        Ok(())
    }

    async fn lock_product(&mut self, id: ProductId) -> DomainResult<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(&mut self, product: &Product) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id, name, selling_price, margin_percent, category_id, image_path,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(product.id().as_uuid())
        .bind(product.name())
        .bind(product.selling_price())
        .bind(product.margin_percent())
        .bind(product.category_id().map(|c| *c.as_uuid()))
        .bind(product.image_path())
        .bind(product_status_str(product.status()))
        .bind(product.created_at())
        .bind(product.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> DomainResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET name = $2, selling_price = $3, margin_percent = $4, category_id = $5,
                image_path = $6, status = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(product.id().as_uuid())
        .bind(product.name())
        .bind(product.selling_price())
        .bind(product.margin_percent())
        .bind(product.category_id().map(|c| *c.as_uuid()))
        .bind(product.image_path())
        .bind(product_status_str(product.status()))
        .bind(product.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("product", product.id()));
        }
        Ok(())
    }

    async fn delete_product(&mut self, id: ProductId) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_product", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("product", id));
        }
        Ok(())
    }

    async fn product_has_sales(&mut self, id: ProductId) -> DomainResult<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM sale_lines WHERE product_id = $1) AS sold")
            .bind(id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("product_has_sales", e))?;
        row.try_get("sold").map_err(|e| decode_error("sale_lines", e))
    }

    async fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>> {
        load_invoice(&mut self.tx, id, true).await
    }

    async fn invoice_number_taken(&mut self, invoice_number: &str, except: Option<InvoiceId>) -> DomainResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM purchase_invoices \
             WHERE invoice_number = $1 AND ($2::uuid IS NULL OR id <> $2)) AS taken",
        )
        .bind(invoice_number)
        .bind(except.map(|id| *id.as_uuid()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("invoice_number_taken", e))?;
        row.try_get("taken").map_err(|e| decode_error("purchase_invoices", e))
    }

    async fn insert_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()> {
        let header = invoice.header();
        sqlx::query(
            r#"
            INSERT INTO purchase_invoices (
                id, invoice_number, supplier_id, invoice_date, due_date,
                payment_date, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(invoice.id().as_uuid())
        .bind(&header.invoice_number)
        .bind(header.supplier_id.map(|s| *s.as_uuid()))
        .bind(header.invoice_date)
        .bind(header.due_date)
        .bind(header.payment_date)
        .bind(invoice.created_at())
        .bind(invoice.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;
        self.write_invoice_lines(invoice).await
    }

    async fn update_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()> {
        let header = invoice.header();
        let result = sqlx::query(
            r#"
            UPDATE purchase_invoices
            SET invoice_number = $2, supplier_id = $3, invoice_date = $4, due_date = $5,
                payment_date = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(invoice.id().as_uuid())
        .bind(&header.invoice_number)
        .bind(header.supplier_id.map(|s| *s.as_uuid()))
        .bind(header.invoice_date)
        .bind(header.due_date)
        .bind(header.payment_date)
        .bind(invoice.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_invoice", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("invoice", invoice.id()));
        }
        self.write_invoice_lines(invoice).await
    }

    async fn delete_invoice(&mut self, id: InvoiceId) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM purchase_invoices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_invoice", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("invoice", id));
        }
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &SaleTransaction) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sales (id, cashier_id, payment_method, total_price, amount_paid, change_due, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(sale.id().as_uuid())
        .bind(sale.cashier_id().as_uuid())
        .bind(sale.payment_method().as_str())
        .bind(sale.total_price())
        .bind(sale.amount_paid())
        .bind(sale.change_due())
        .bind(sale.created_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_sale", e))?;

        for (position, line) in sale.lines().iter().enumerate() {
            sqlx::query(
                "INSERT INTO sale_lines (sale_id, position, product_id, quantity, price_at_sale) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(sale.id().as_uuid())
            .bind(position as i32)
            .bind(line.product_id.as_uuid())
            .bind(line.quantity)
            .bind(line.price_at_sale)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_sale_line", e))?;
        }
        Ok(())
    }

    async fn append_movements(&mut self, movements: Vec<StockMovement>) -> DomainResult<()> {
        for movement in movements {
            let batch_id = movement.batch_id();
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence_number), 0) AS current FROM stock_movements WHERE batch_id = $1",
            )
            .bind(batch_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("journal_version", e))?;
            let current: i64 = row.try_get("current").map_err(|e| decode_error("stock_movements", e))?;

            let payload = serde_json::to_value(&movement)
                .map_err(|e| DomainError::storage(format!("stock movement serialization failed: {e}")))?;
            let envelope = EventEnvelope::seal(current as u64 + 1, movement);

            sqlx::query(
                r#"
                INSERT INTO stock_movements (
                    event_id, batch_id, sequence_number, event_type, event_version, occurred_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(envelope.event_id())
            .bind(envelope.stream_id())
            .bind(envelope.sequence_number() as i64)
            .bind(envelope.event_type())
            .bind(envelope.payload().version() as i32)
            .bind(envelope.occurred_at())
            .bind(&payload)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("append_movement", e))?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DomainResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

async fn load_invoice(
    conn: &mut sqlx::PgConnection,
    id: InvoiceId,
    for_update: bool,
) -> DomainResult<Option<PurchaseInvoice>> {
    let sql = format!(
        "SELECT {INVOICE_COLUMNS} FROM purchase_invoices WHERE id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let Some(row) = sqlx::query(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_invoice", e))?
    else {
        return Ok(None);
    };

    let line_rows = sqlx::query(
        "SELECT line_id, product_name, packaging_unit, unit_cost, expiry_date, quantity \
         FROM invoice_lines WHERE invoice_id = $1 ORDER BY position",
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_invoice_lines", e))?;

    let decode = |e| decode_error("purchase_invoices", e);
    let mut lines = Vec::with_capacity(line_rows.len());
    for r in &line_rows {
        lines.push(InvoiceLine {
            line_id: LineId::from_uuid(r.try_get("line_id").map_err(decode)?),
            lot: LotSpec {
                product_name: r.try_get("product_name").map_err(decode)?,
                packaging_unit: r.try_get("packaging_unit").map_err(decode)?,
                unit_cost: r.try_get("unit_cost").map_err(decode)?,
                expiry_date: r.try_get("expiry_date").map_err(decode)?,
            },
            quantity: r.try_get("quantity").map_err(decode)?,
        });
    }

    let supplier: Option<Uuid> = row.try_get("supplier_id").map_err(decode)?;
    let parts = InvoiceParts {
        id: InvoiceId::from_uuid(row.try_get("id").map_err(decode)?),
        header: InvoiceHeader {
            invoice_number: row.try_get("invoice_number").map_err(decode)?,
            supplier_id: supplier.map(SupplierId::from_uuid),
            invoice_date: row.try_get("invoice_date").map_err(decode)?,
            due_date: row.try_get("due_date").map_err(decode)?,
            payment_date: row.try_get("payment_date").map_err(decode)?,
        },
        lines,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    };
    PurchaseInvoice::restore(parts).map(Some)
}

fn batch_from_row(row: &PgRow) -> DomainResult<Batch> {
    let decode = |e| decode_error("batches", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let product: Option<Uuid> = row.try_get("product_id").map_err(decode)?;
    let state = BatchState::from_columns(
        BatchStatus::parse(&status)?,
        product.map(ProductId::from_uuid),
    )?;

    Batch::restore(BatchParts {
        id: BatchId::from_uuid(row.try_get("id").map_err(decode)?),
        invoice_id: InvoiceId::from_uuid(row.try_get("invoice_id").map_err(decode)?),
        line_id: LineId::from_uuid(row.try_get("line_id").map_err(decode)?),
        lot: LotSpec {
            product_name: row.try_get("product_name").map_err(decode)?,
            packaging_unit: row.try_get("packaging_unit").map_err(decode)?,
            unit_cost: row.try_get("unit_cost").map_err(decode)?,
            expiry_date: row.try_get("expiry_date").map_err(decode)?,
        },
        remaining_quantity: row.try_get("remaining_quantity").map_err(decode)?,
        state,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn product_from_row(row: &PgRow) -> DomainResult<Product> {
    let decode = |e| decode_error("products", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let category: Option<Uuid> = row.try_get("category_id").map_err(decode)?;
    Ok(Product::restore(ProductParts {
        id: ProductId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        selling_price: row.try_get("selling_price").map_err(decode)?,
        margin_percent: row.try_get("margin_percent").map_err(decode)?,
        category_id: category.map(CategoryId::from_uuid),
        image_path: row.try_get("image_path").map_err(decode)?,
        status: match status.as_str() {
            "active" => ProductStatus::Active,
            "deleted" => ProductStatus::Deleted,
            other => return Err(DomainError::storage(format!("unknown product status '{other}'"))),
        },
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    }))
}

fn product_status_str(status: ProductStatus) -> &'static str {
    match status {
        ProductStatus::Active => "active",
        ProductStatus::Deleted => "deleted",
    }
}

fn decode_error(table: &str, err: sqlx::Error) -> DomainError {
    DomainError::storage(format!("failed to decode {table} row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") | Some("40001") | Some("40P01") => {
                    warn!(operation, "row lock contention: {}", db_err.message());
                    DomainError::contention(msg)
                }
                Some("23505") => DomainError::conflict(msg),
                _ => DomainError::storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            DomainError::contention(format!("no database connection available for {operation}"))
        }
        sqlx::Error::PoolClosed => {
            DomainError::storage(format!("connection pool closed in {operation}"))
        }
        _ => DomainError::storage(format!("sqlx error in {operation}: {err}")),
    }
}
