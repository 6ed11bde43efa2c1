use serde::Deserialize;

const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    10
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl Pagination {
    /// Out-of-range values never error; they clamp.
    pub fn clamp(&self) -> Self {
        let page = self.page.max(1);
        let page_size = match self.page_size {
            0 => default_page_size(),
            size if size > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
            size => size,
        };
        Self { page, page_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_page_and_size() {
        let p = Pagination {
            page: 0,
            page_size: 500,
        }
        .clamp();
        assert_eq!(p.page, 1);
        assert_eq!(p.page_size, 100);

        let p = Pagination {
            page: 3,
            page_size: 0,
        }
        .clamp();
        assert_eq!(p.page, 3);
        assert_eq!(p.page_size, 10);
    }
}
