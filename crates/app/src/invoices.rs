use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use invoice_dash_core::form::{validate, FieldErrors, InvoiceForm};
use invoice_dash_core::types::invoice_date;
use invoice_dash_storage::{Database, DeleteOutcome, InvoiceChanges, InvoiceError, NewInvoice};

/// Path of the invoice list view, revalidated and navigated to after mutations.
pub const INVOICES_PATH: &str = "/dashboard/invoices";

const CREATE_VALIDATION_MESSAGE: &str = "Missing Fields. Failed to Create Invoice.";
const UPDATE_VALIDATION_MESSAGE: &str = "Missing Fields. Failed to Update Invoice.";
const CREATE_DATABASE_MESSAGE: &str = "Database Error: Failed to Create Invoice.";
const UPDATE_DATABASE_MESSAGE: &str = "Database Error: Failed to Update Invoice.";
const DELETE_DATABASE_MESSAGE: &str = "Database Error: Failed to Delete Invoice.";
const DELETED_MESSAGE: &str = "Deleted Invoice.";

/// Signals a successful mutation hands back to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub message: Option<String>,
    /// Paths whose cached renderings are stale.
    pub revalidate: Vec<&'static str>,
    pub redirect: Option<&'static str>,
}

impl MutationOutcome {
    fn back_to_list() -> Self {
        Self {
            message: None,
            revalidate: vec![INVOICES_PATH],
            redirect: Some(INVOICES_PATH),
        }
    }

    fn deleted() -> Self {
        Self {
            message: Some(DELETED_MESSAGE.to_string()),
            revalidate: vec![INVOICES_PATH],
            redirect: None,
        }
    }
}

/// Expected failures of an invoice mutation, already phrased for the form.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("{message}")]
    Validation {
        message: &'static str,
        errors: FieldErrors,
    },
    #[error("{message}")]
    Database { message: &'static str },
}

impl MutationError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Validation { message, .. } | Self::Database { message } => message,
        }
    }
}

/// Validates invoice forms and writes them to the `invoices` table.
#[derive(Clone)]
pub struct InvoiceService {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl InvoiceService {
    pub fn new(database: Database, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        Self { database, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates an invoice dated today. Nothing is written if validation fails.
    pub async fn create_invoice(
        &self,
        form: &InvoiceForm,
    ) -> Result<MutationOutcome, MutationError> {
        let valid = validate(form).map_err(|errors| {
            record("create", "invalid");
            MutationError::Validation {
                message: CREATE_VALIDATION_MESSAGE,
                errors,
            }
        })?;

        let date = invoice_date(self.now());
        let id = self
            .database
            .invoices()
            .insert(&NewInvoice {
                customer_id: &valid.customer_id,
                amount: valid.amount_cents,
                status: valid.status,
                date: &date,
            })
            .await
            .map_err(|err| {
                error!(
                    stage = "invoices",
                    op = "create",
                    customer_id = %valid.customer_id,
                    error = %err,
                    "failed to insert invoice"
                );
                record("create", "database_error");
                MutationError::Database {
                    message: CREATE_DATABASE_MESSAGE,
                }
            })?;

        info!(
            stage = "invoices",
            op = "create",
            invoice_id = %id,
            amount = valid.amount_cents,
            status = %valid.status,
            "invoice created"
        );
        record("create", "ok");
        Ok(MutationOutcome::back_to_list())
    }

    /// Updates customer, amount and status. A missing id is reported as a
    /// database failure.
    pub async fn update_invoice(
        &self,
        id: &str,
        form: &InvoiceForm,
    ) -> Result<MutationOutcome, MutationError> {
        let valid = validate(form).map_err(|errors| {
            record("update", "invalid");
            MutationError::Validation {
                message: UPDATE_VALIDATION_MESSAGE,
                errors,
            }
        })?;

        let changes = InvoiceChanges {
            customer_id: &valid.customer_id,
            amount: valid.amount_cents,
            status: valid.status,
        };
        match self.database.invoices().update(id, &changes).await {
            Ok(()) => {}
            Err(InvoiceError::NotFound) => {
                warn!(stage = "invoices", op = "update", invoice_id = %id, "invoice not found");
                record("update", "not_found");
                return Err(MutationError::Database {
                    message: UPDATE_DATABASE_MESSAGE,
                });
            }
            Err(err) => {
                error!(
                    stage = "invoices",
                    op = "update",
                    invoice_id = %id,
                    error = %err,
                    "failed to update invoice"
                );
                record("update", "database_error");
                return Err(MutationError::Database {
                    message: UPDATE_DATABASE_MESSAGE,
                });
            }
        }

        info!(stage = "invoices", op = "update", invoice_id = %id, "invoice updated");
        record("update", "ok");
        Ok(MutationOutcome::back_to_list())
    }

    /// Deletes an invoice. Deleting an id that does not exist succeeds.
    pub async fn delete_invoice(&self, id: &str) -> Result<MutationOutcome, MutationError> {
        match self.database.invoices().delete(id).await {
            Ok(DeleteOutcome::Deleted) => {
                info!(stage = "invoices", op = "delete", invoice_id = %id, "invoice deleted");
                record("delete", "ok");
            }
            Ok(DeleteOutcome::Missing) => {
                debug!(
                    stage = "invoices",
                    op = "delete",
                    invoice_id = %id,
                    "invoice already absent"
                );
                record("delete", "missing");
            }
            Err(err) => {
                error!(
                    stage = "invoices",
                    op = "delete",
                    invoice_id = %id,
                    error = %err,
                    "failed to delete invoice"
                );
                record("delete", "database_error");
                return Err(MutationError::Database {
                    message: DELETE_DATABASE_MESSAGE,
                });
            }
        }

        Ok(MutationOutcome::deleted())
    }
}

fn record(op: &'static str, result: &'static str) {
    counter!("invoice_mutations_total", "op" => op, "result" => result).increment(1);
}

#[cfg(test)]
pub(crate) mod test_support {
    use invoice_dash_storage::{Customer, Database};
    use tempfile::TempDir;

    /// File-backed database with the schema and two customers.
    pub async fn seeded_database() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");

        for (id, name, email) in [
            ("c-1", "Evil Rabbit", "evil@rabbit.com"),
            ("c-2", "Delba de Oliveira", "delba@oliveira.com"),
        ] {
            database
                .customers()
                .insert(&Customer {
                    id: id.to_string(),
                    name: name.to_string(),
                    email: email.to_string(),
                    image_url: String::new(),
                })
                .await
                .expect("insert customer");
        }

        (dir, database)
    }

    pub async fn invoice_count(database: &Database) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invoices")
            .fetch_one(database.pool())
            .await
            .expect("count invoices");
        count
    }
}
