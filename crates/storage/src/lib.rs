use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use invoice_dash_core::types::{Invoice, InvoiceStatus, ParseStatusError};

/// Number of invoices shown on one page of the dashboard list.
pub const ITEMS_PER_PAGE: u32 = 6;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // foreign_keys is per connection, so every pooled connection needs it.
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to interact with the invoices table.
    pub fn invoices(&self) -> InvoiceRepository {
        InvoiceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for reading and seeding customers.
    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the `invoices` table.
///
/// Every mutating method issues exactly one statement and relies on SQLite
/// for atomicity.
#[derive(Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

impl InvoiceRepository {
    /// Inserts a new invoice and returns its generated identifier.
    pub async fn insert(&self, record: &NewInvoice<'_>) -> Result<String, InvoiceError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO invoices (id, customer_id, amount, status, date) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.customer_id)
        .bind(record.amount)
        .bind(record.status.as_str())
        .bind(record.date)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        Ok(id)
    }

    /// Updates customer, amount and status of an existing invoice.
    ///
    /// Returns [`InvoiceError::NotFound`] when no row carries `id`.
    pub async fn update(&self, id: &str, changes: &InvoiceChanges<'_>) -> Result<(), InvoiceError> {
        let result = sqlx::query(
            "UPDATE invoices SET customer_id = ?, amount = ?, status = ? WHERE id = ?",
        )
        .bind(changes.customer_id)
        .bind(changes.amount)
        .bind(changes.status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(InvoiceError::NotFound);
        }
        Ok(())
    }

    /// Deletes the invoice with the provided identifier.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome, InvoiceError> {
        let result = sqlx::query("DELETE FROM invoices WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::Missing)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    /// Loads a single invoice by identifier.
    pub async fn fetch(&self, id: &str) -> Result<Option<Invoice>, InvoiceError> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            "SELECT id, customer_id, amount, status, date FROM invoices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InvoiceRow::into_domain).transpose()
    }

    /// Lists one page of invoices joined with their customer, newest first.
    ///
    /// `query` is matched case-insensitively against customer name and email,
    /// the amount, the date and the status.
    pub async fn list_filtered(
        &self,
        query: &str,
        page: u32,
    ) -> Result<Vec<InvoiceListEntry>, InvoiceError> {
        let pattern = like_pattern(query);
        let offset = i64::from(page.max(1) - 1) * i64::from(ITEMS_PER_PAGE);

        let rows = sqlx::query_as::<_, InvoiceListRow>(
            r#"
SELECT i.id,
       i.customer_id,
       i.amount,
       i.status,
       i.date,
       c.name,
       c.email,
       c.image_url
  FROM invoices AS i
  JOIN customers AS c
    ON i.customer_id = c.id
 WHERE c.name LIKE ?1 ESCAPE '\'
    OR c.email LIKE ?1 ESCAPE '\'
    OR CAST(i.amount AS TEXT) LIKE ?1 ESCAPE '\'
    OR i.date LIKE ?1 ESCAPE '\'
    OR i.status LIKE ?1 ESCAPE '\'
 ORDER BY i.date DESC, i.id ASC
 LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(&pattern)
        .bind(i64::from(ITEMS_PER_PAGE))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InvoiceListRow::into_domain).collect()
    }

    /// Counts the pages needed to show every invoice matching `query`.
    pub async fn count_pages(&self, query: &str) -> Result<u32, InvoiceError> {
        let pattern = like_pattern(query);
        let (count,): (i64,) = sqlx::query_as(
            r#"
SELECT COUNT(*)
  FROM invoices AS i
  JOIN customers AS c
    ON i.customer_id = c.id
 WHERE c.name LIKE ?1 ESCAPE '\'
    OR c.email LIKE ?1 ESCAPE '\'
    OR CAST(i.amount AS TEXT) LIKE ?1 ESCAPE '\'
    OR i.date LIKE ?1 ESCAPE '\'
    OR i.status LIKE ?1 ESCAPE '\'
            "#,
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let per_page = i64::from(ITEMS_PER_PAGE);
        let pages = (count + per_page - 1) / per_page;
        u32::try_from(pages).map_err(|_| InvoiceError::PageCount(pages))
    }
}

/// Wraps the search text in `%` wildcards, escaping LIKE metacharacters so
/// they match literally. Pairs with `ESCAPE '\'` in the statement.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for ch in query.trim().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn map_write_error(err: sqlx::Error) -> InvoiceError {
    match err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_CONSTRAINT_FOREIGNKEY
            if db_err.code().as_deref() == Some("787") {
                InvoiceError::UnknownCustomer
            } else {
                InvoiceError::Database(sqlx::Error::Database(db_err))
            }
        }
        other => InvoiceError::Database(other),
    }
}

/// Data required to insert an invoice. The id is generated on insert.
#[derive(Debug, Clone)]
pub struct NewInvoice<'a> {
    pub customer_id: &'a str,
    pub amount: i64,
    pub status: InvoiceStatus,
    pub date: &'a str,
}

/// Mutable columns of an invoice.
#[derive(Debug, Clone)]
pub struct InvoiceChanges<'a> {
    pub customer_id: &'a str,
    pub amount: i64,
    pub status: InvoiceStatus,
}

/// Result of a delete statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
}

/// Errors that can occur while reading or mutating invoices.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice not found")]
    NotFound,
    #[error("customer referenced by invoice does not exist")]
    UnknownCustomer,
    #[error("failed to decode invoice row: {0}")]
    Decode(#[from] ParseStatusError),
    #[error("invoice page count {0} is out of range")]
    PageCount(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    customer_id: String,
    amount: i64,
    status: String,
    date: String,
}

impl InvoiceRow {
    fn into_domain(self) -> Result<Invoice, InvoiceError> {
        Ok(Invoice {
            id: self.id,
            customer_id: self.customer_id,
            amount: self.amount,
            status: self.status.parse()?,
            date: self.date,
        })
    }
}

/// Invoice joined with the customer columns shown in the list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceListEntry {
    pub invoice: Invoice,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_image_url: String,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceListRow {
    id: String,
    customer_id: String,
    amount: i64,
    status: String,
    date: String,
    name: String,
    email: String,
    image_url: String,
}

impl InvoiceListRow {
    fn into_domain(self) -> Result<InvoiceListEntry, InvoiceError> {
        Ok(InvoiceListEntry {
            invoice: Invoice {
                id: self.id,
                customer_id: self.customer_id,
                amount: self.amount,
                status: self.status.parse()?,
                date: self.date,
            },
            customer_name: self.name,
            customer_email: self.email,
            customer_image_url: self.image_url,
        })
    }
}

/// Repository for the read-mostly `customers` table.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    /// Inserts a customer. Used for seeding.
    pub async fn insert(&self, customer: &Customer) -> Result<(), CustomerError> {
        sqlx::query("INSERT INTO customers (id, name, email, image_url) VALUES (?, ?, ?, ?)")
            .bind(&customer.id)
            .bind(&customer.name)
            .bind(&customer.email)
            .bind(&customer.image_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists every customer ordered by name, as offered by the invoice form.
    pub async fn list(&self) -> Result<Vec<Customer>, CustomerError> {
        let rows = sqlx::query_as::<_, Customer>(
            "SELECT id, name, email, image_url FROM customers ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Customer row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub image_url: String,
}

/// Errors that can occur when reading customers.
#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
