//! Server-rendered pages for the invoice list.

use askama::Template;

use invoice_dash_core::pagination::{PageLink, PaginationPlan, Position};
use invoice_dash_core::types::InvoiceStatus;
use invoice_dash_storage::InvoiceListEntry;

/// Formats cents as a dollar amount with thousands separators, e.g. `$1,234.50`.
pub fn format_currency(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let dollars = (cents / 100).to_string();

    let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
    for (index, digit) in dollars.chars().enumerate() {
        if index > 0 && (dollars.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    format!("{sign}${grouped}.{:02}", cents % 100)
}

#[derive(Template)]
#[template(path = "invoices.html")]
pub struct InvoicePage<'a> {
    query: &'a str,
    rows: Vec<InvoiceRow<'a>>,
    previous: Option<&'a str>,
    pages: Vec<PageSlot<'a>>,
    next: Option<&'a str>,
}

impl<'a> InvoicePage<'a> {
    pub fn new(entries: &'a [InvoiceListEntry], query: &'a str, plan: &'a PaginationPlan) -> Self {
        Self {
            query,
            rows: entries.iter().map(InvoiceRow::from).collect(),
            previous: plan.previous.href.as_deref(),
            pages: plan.pages.iter().map(PageSlot::from).collect(),
            next: plan.next.href.as_deref(),
        }
    }
}

struct InvoiceRow<'a> {
    id: &'a str,
    name: &'a str,
    email: &'a str,
    image_url: &'a str,
    amount: String,
    date: &'a str,
    status: InvoiceStatus,
}

impl<'a> From<&'a InvoiceListEntry> for InvoiceRow<'a> {
    fn from(entry: &'a InvoiceListEntry) -> Self {
        Self {
            id: &entry.invoice.id,
            name: &entry.customer_name,
            email: &entry.customer_email,
            image_url: &entry.customer_image_url,
            amount: format_currency(entry.invoice.amount),
            date: &entry.invoice.date,
            status: entry.invoice.status,
        }
    }
}

/// A page number or ellipsis. Only slots with an `href` render as links.
struct PageSlot<'a> {
    class: String,
    label: String,
    href: Option<&'a str>,
}

impl<'a> From<&'a PageLink> for PageSlot<'a> {
    fn from(link: &'a PageLink) -> Self {
        let mut classes = vec!["page"];
        if let Some(position) = link.position {
            classes.push(position.as_str());
        }
        if link.active {
            classes.push("active");
        }

        let href = match link.position {
            Some(Position::Middle) => None,
            _ => link.href.as_deref(),
        };

        Self {
            class: classes.join(" "),
            label: link.item.label(),
            href,
        }
    }
}
