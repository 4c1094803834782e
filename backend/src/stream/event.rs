use std::time::Duration;

use uuid::Uuid;

use super::logs::LogLine;

/// One server-sent event, encoded and dropped as soon as it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    /// Time-ordered UUIDv7, so ids sort by emission time.
    pub id: String,
    pub event_type: String,
    pub data: String,
    pub retry: Option<Duration>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            data: data.into(),
            retry: None,
        }
    }

    /// Wire form: `id:`, optional `event: `, optional `retry: `, one `data:`
    /// line per payload line, then a blank line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + self.id.len() + 16);
        out.push_str("id:");
        out.push_str(&self.id);
        out.push('\n');

        if !self.event_type.is_empty() {
            out.push_str("event: ");
            out.push_str(&self.event_type);
            out.push('\n');
        }

        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {}\n", retry.as_millis()));
        }

        for line in self.data.split('\n') {
            out.push_str("data:");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

impl From<LogLine> for DomainEvent {
    fn from(line: LogLine) -> Self {
        DomainEvent::new("", line.text)
    }
}
