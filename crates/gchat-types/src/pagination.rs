use serde::{Deserialize, Serialize};

use crate::validator::ValidationErrors;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE: i64 = 10_000_000;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Page request plus an optional sort key checked against `sort_safe_list`.
/// A leading `-` on the sort key means descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
    pub page: i64,
    pub page_size: i64,
    pub sort: String,
    pub sort_safe_list: &'static [&'static str],
}

impl Filters {
    pub fn new(page: i64, page_size: i64) -> Self {
        Self {
            page,
            page_size,
            sort: String::new(),
            sort_safe_list: &[],
        }
    }

    pub fn with_sort(mut self, sort: impl Into<String>, safe_list: &'static [&'static str]) -> Self {
        self.sort = sort.into();
        self.sort_safe_list = safe_list;
        self
    }

    pub fn validate(&self, v: &mut ValidationErrors) {
        v.check(self.page > 0, "page", "must be greater than zero");
        v.check(self.page <= MAX_PAGE, "page", "must be a maximum of 10 million");
        v.check(self.page_size > 0, "page_size", "must be greater than zero");
        v.check(self.page_size <= MAX_PAGE_SIZE, "page_size", "must be a maximum of 100");

        if !self.sort_safe_list.is_empty() && !self.sort.is_empty() {
            v.check(
                self.sort_safe_list.contains(&self.sort.as_str()),
                "sort",
                "invalid sort value",
            );
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }

    /// Column name of an allow-listed sort key. `None` when the key is not in
    /// the safe list, so an unchecked value can never reach a query.
    pub fn sort_column(&self) -> Option<&str> {
        self.sort_safe_list
            .contains(&self.sort.as_str())
            .then(|| self.sort.trim_start_matches('-'))
    }

    pub fn sort_direction(&self) -> SortDirection {
        if self.sort.starts_with('-') {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

impl Default for Filters {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMetadata {
    pub current_page: i64,
    pub page_size: i64,
    pub first_page: i64,
    pub last_page: i64,
    pub total_records: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid page")]
pub struct InvalidPage;

pub fn calculate_pagination_metadata(
    total_records: i64,
    page: i64,
    page_size: i64,
) -> Result<PaginationMetadata, InvalidPage> {
    if total_records == 0 {
        if page != 1 {
            return Err(InvalidPage);
        }

        return Ok(PaginationMetadata {
            current_page: 1,
            page_size,
            first_page: 1,
            last_page: 1,
            total_records: 0,
        });
    }

    Ok(PaginationMetadata {
        current_page: page,
        page_size,
        first_page: 1,
        // integer ceiling division
        last_page: (total_records + page_size - 1) / page_size,
        total_records,
    })
}
