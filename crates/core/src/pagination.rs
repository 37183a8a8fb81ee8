use serde::{Serialize, Serializer};
use url::form_urlencoded;

/// Pages beyond which the window collapses into ellipses.
const MAX_UNCOLLAPSED_PAGES: u32 = 7;

/// One slot in the pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageItem {
    Page(u32),
    Ellipsis,
}

impl PageItem {
    /// Text shown for the slot.
    pub fn label(self) -> String {
        match self {
            Self::Page(page) => page.to_string(),
            Self::Ellipsis => "...".to_string(),
        }
    }
}

impl Serialize for PageItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Page(page) => serializer.serialize_u32(*page),
            Self::Ellipsis => serializer.serialize_str("..."),
        }
    }
}

/// Computes which page numbers and ellipses to render.
///
/// `total_pages` is treated as at least one and `current_page` is clamped into
/// `1..=total_pages` before the window is chosen.
pub fn generate_pagination(current_page: u32, total_pages: u32) -> Vec<PageItem> {
    use PageItem::{Ellipsis, Page};

    let total = total_pages.max(1);
    let current = current_page.clamp(1, total);

    if total <= MAX_UNCOLLAPSED_PAGES {
        return (1..=total).map(Page).collect();
    }

    if current <= 3 {
        return vec![
            Page(1),
            Page(2),
            Page(3),
            Page(4),
            Ellipsis,
            Page(total - 1),
            Page(total),
        ];
    }

    if current >= total - 2 {
        return vec![
            Page(1),
            Page(2),
            Ellipsis,
            Page(total - 2),
            Page(total - 1),
            Page(total),
        ];
    }

    vec![
        Page(1),
        Ellipsis,
        Page(current - 1),
        Page(current),
        Page(current + 1),
        Ellipsis,
        Page(total),
    ]
}

/// Visual placement of a pagination element within the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    First,
    Last,
    Single,
    Middle,
}

impl Position {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::Single => "single",
            Self::Middle => "middle",
        }
    }
}

/// A rendered page slot. `href` is `None` for the active page and for ellipses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageLink {
    pub item: PageItem,
    pub href: Option<String>,
    pub position: Option<Position>,
    pub active: bool,
}

/// Previous/next arrow. A disabled arrow has no `href`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Arrow {
    pub href: Option<String>,
}

/// Everything a view needs to draw the pagination row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationPlan {
    pub current_page: u32,
    pub total_pages: u32,
    pub previous: Arrow,
    pub next: Arrow,
    pub pages: Vec<PageLink>,
}

/// Builds the pagination row for `base_path`, keeping every query parameter in
/// `params` except `page`, which is replaced per link.
pub fn pagination_links(
    current_page: u32,
    total_pages: u32,
    base_path: &str,
    params: &[(String, String)],
) -> PaginationPlan {
    let total = total_pages.max(1);
    let current = current_page.clamp(1, total);
    let items = generate_pagination(current, total);
    let last_index = items.len() - 1;

    let pages = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let position = match item {
                PageItem::Ellipsis => Some(Position::Middle),
                _ if items.len() == 1 => Some(Position::Single),
                _ if index == last_index => Some(Position::Last),
                _ if index == 0 => Some(Position::First),
                _ => None,
            };
            let active = *item == PageItem::Page(current);
            let href = match item {
                PageItem::Page(page) if !active => Some(page_url(base_path, params, *page)),
                _ => None,
            };
            PageLink {
                item: *item,
                href,
                position,
                active,
            }
        })
        .collect();

    let previous = Arrow {
        href: (current > 1).then(|| page_url(base_path, params, current - 1)),
    };
    let next = Arrow {
        href: (current < total).then(|| page_url(base_path, params, current + 1)),
    };

    PaginationPlan {
        current_page: current,
        total_pages: total,
        previous,
        next,
        pages,
    }
}

/// Returns `base_path` with the query string from `params` and `page` set.
pub fn page_url(base_path: &str, params: &[(String, String)], page: u32) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params.iter().filter(|(key, _)| key != "page") {
        serializer.append_pair(key, value);
    }
    serializer.append_pair("page", &page.to_string());
    format!("{base_path}?{}", serializer.finish())
}
