//! Domain layer shared by the storage crate and the HTTP application.
//!
//! Everything in here is synchronous and free of I/O: invoice types, form
//! validation with cents conversion, and the pagination window.

pub mod form;
pub mod pagination;
pub mod types;

pub use form::{validate, FieldErrors, InvoiceForm, ValidatedInvoice};
pub use pagination::{generate_pagination, pagination_links, PageItem, PaginationPlan};
pub use types::{Invoice, InvoiceStatus, ParseStatusError};
