use serde::{Deserialize, Serialize};

use crate::core::{NotificationSettings, Task, TaskState};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;
/// Highest page number whose offset still fits in an `i64`.
pub const MAX_PAGE: i64 = i64::MAX / MAX_PAGE_SIZE;

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,
    pub message: String,
}

/// Body of `POST /tasks` and `PUT /tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskInput {
    #[serde(alias = "name")]
    pub name: String,
    #[serde(alias = "schedule")]
    pub schedule: String,
    #[serde(alias = "command")]
    pub command: String,
    #[serde(default, alias = "method")]
    pub method: String,
    #[serde(default, alias = "headers")]
    pub headers: String,
    #[serde(default, alias = "description")]
    pub description: String,
    #[serde(default = "default_enabled", alias = "enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub notifications: NotificationSettings,
}

fn default_enabled() -> bool {
    true
}

/// A task as served to clients, with its live scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    #[serde(rename = "State")]
    pub state: TaskState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    #[serde(alias = "pageSize")]
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl PageRequest {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(1).min(MAX_PAGE);
        let page_size = page_size
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);
        Self { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }
}

impl From<PageQuery> for PageRequest {
    fn from(query: PageQuery) -> Self {
        PageRequest::new(query.page, query.page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(request: PageRequest, total: i64, data: Vec<T>) -> Self {
        let total_pages = (total + request.page_size - 1) / request.page_size;
        Self {
            page: request.page,
            page_size: request.page_size,
            total,
            total_pages,
            data,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            page: self.page,
            page_size: self.page_size,
            total: self.total,
            total_pages: self.total_pages,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps() {
        assert_eq!(PageRequest::new(None, None), PageRequest { page: 1, page_size: 10 });
        assert_eq!(PageRequest::new(Some(0), Some(-3)), PageRequest { page: 1, page_size: 10 });
        assert_eq!(PageRequest::new(Some(3), Some(500)).page_size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(Some(3), Some(20)).offset(), 40);
    }

    #[test]
    fn huge_page_numbers_do_not_overflow() {
        let request = PageRequest::new(Some(i64::MAX), Some(10));
        assert_eq!(request.page, MAX_PAGE);
        assert!(request.offset() > 0);

        let request = PageRequest::new(Some(i64::MAX), Some(i64::MAX));
        assert_eq!(request.page_size, MAX_PAGE_SIZE);
        assert_eq!(request.offset(), (MAX_PAGE - 1) * MAX_PAGE_SIZE);

        let unclamped = PageRequest {
            page: i64::MAX,
            page_size: i64::MAX,
        };
        assert_eq!(unclamped.offset(), i64::MAX);
    }

    #[test]
    fn page_counts_partial_pages() {
        let page = Page::new(PageRequest::new(Some(1), Some(10)), 21, vec![1, 2, 3]);
        assert_eq!(page.total_pages, 3);
        let empty: Page<i32> = Page::new(PageRequest::new(None, None), 0, vec![]);
        assert_eq!(empty.total_pages, 0);
    }

    #[test]
    fn task_input_accepts_both_casings() {
        let upper: TaskInput = serde_json::from_str(
            r#"{"Name":"a","Schedule":"* * * * *","Command":"echo hi","Enabled":false}"#,
        )
        .unwrap();
        assert_eq!(upper.name, "a");
        assert!(!upper.enabled);

        let lower: TaskInput = serde_json::from_str(
            r#"{"name":"b","schedule":"* * * * *","command":"http://x","method":"POST"}"#,
        )
        .unwrap();
        assert_eq!(lower.method, "POST");
        assert!(lower.enabled);
        assert!(lower.notifications.notify_on_failure);
        assert!(lower.notifications.notification_types.is_empty());

        let notified: TaskInput = serde_json::from_str(
            r#"{"Name":"c","Schedule":"* * * * *","Command":"true","NotifyOnSuccess":true,
                "NotificationTypes":["wechat"],
                "NotificationConfig":{"wechat":{"webhook_url":"http://hook"}}}"#,
        )
        .unwrap();
        assert!(notified.notifications.should_notify(true));
        assert_eq!(notified.notifications.unconfigured(), None);
    }
}
