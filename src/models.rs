//! Domain records exchanged with the collaborators.

use serde::{Deserialize, Serialize};

/// A support ticket as returned by the ticketing API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: u64,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub requester_id: Option<u64>,
    #[serde(default)]
    pub assignee_id: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// RFC 3339 timestamp as sent by the API
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Ticket {
    pub fn new(id: u64, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            subject: subject.into(),
            description: description.into(),
            status: "open".to_string(),
            priority: None,
            requester_id: None,
            assignee_id: None,
            tags: Vec::new(),
            created_at: None,
        }
    }

    /// Text handed to the enrichment service
    #[must_use]
    pub fn content(&self) -> String {
        if self.description.is_empty() {
            self.subject.clone()
        } else {
            format!("{}\n\n{}", self.subject, self.description)
        }
    }

    /// Every user this ticket references
    #[must_use]
    pub fn user_ids(&self) -> Vec<u64> {
        self.requester_id.into_iter().chain(self.assignee_id).collect()
    }
}

/// A saved ticket view (a named filter on the ticketing side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub title: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Which tickets to fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFilter {
    pub view_id: Option<u64>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl TicketFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn view(view_id: u64) -> Self {
        Self {
            view_id: Some(view_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Key in the tickets store
    ///
    /// View-scoped filters start with `view:<id>` so a whole view can be
    /// dropped with one prefix invalidation.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut key = match self.view_id {
            Some(id) => format!("view:{id}"),
            None => "all".to_string(),
        };
        if let Some(status) = &self.status {
            key.push_str(":status=");
            key.push_str(status);
        }
        if let Some(limit) = self.limit {
            key.push_str(&format!(":limit={limit}"));
        }
        key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// What the enrichment service says about one ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sentiment: Sentiment,
    pub category: String,
    pub urgency: Urgency,
    /// 0.0 to 1.0
    pub confidence: f32,
    #[serde(default)]
    pub summary: String,
}
