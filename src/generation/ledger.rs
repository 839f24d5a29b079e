use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenArrival {
    pub token: String,
    pub arrived_at: Instant,
}

/// Append-only record of the tokens produced in one generation session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenLedger {
    entries: Vec<TokenArrival>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: impl Into<String>) {
        self.push_at(token, Instant::now());
    }

    pub fn push_at(&mut self, token: impl Into<String>, arrived_at: Instant) {
        self.entries.push(TokenArrival {
            token: token.into(),
            arrived_at,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TokenArrival] {
        &self.entries
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.token.as_str())
    }

    /// Time between the first and the last arrival.
    pub fn span(&self) -> Option<Duration> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some(last.arrived_at.saturating_duration_since(first.arrived_at))
    }

    /// `len / (last - first)` in seconds; 0 without a measurable interval.
    pub fn tokens_per_second(&self) -> f64 {
        if self.entries.len() < 2 {
            return 0.0;
        }
        let seconds = self.span().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        if seconds > 0.0 {
            self.entries.len() as f64 / seconds
        } else {
            0.0
        }
    }
}
