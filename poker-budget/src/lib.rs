// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-`(chat_id, round_id)` accounting for outbound messaging categories,
//! so one hand cannot flood the transport layer with turn prompts, stage
//! transitions, inline-keyboard refreshes, or countdown updates beyond a
//! configured cap. Grounded on `utils/request_tracker.py::RequestTracker`.

mod error;

use std::collections::HashMap;

pub use error::BudgetError;

/// The env var that turns on a verbose log line for every accepted
/// reservation, not just the once-per-round threshold crossing. Renamed
/// from the original bot's own var name since this crate has no other tie
/// to that deployment.
pub const VERBOSE_ENV_VAR: &str = "POKER_REQUEST_TRACKER_VERBOSE";

/// A message category this tracker accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
    Turn,
    Stage,
    Inline,
    Countdown,
}

impl RequestCategory {
    pub fn parse(raw: &str) -> Result<Self, BudgetError> {
        match raw {
            "turn" => Ok(RequestCategory::Turn),
            "stage" => Ok(RequestCategory::Stage),
            "inline" => Ok(RequestCategory::Inline),
            "countdown" => Ok(RequestCategory::Countdown),
            other => Err(BudgetError::UnknownCategory(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Turn => "turn",
            RequestCategory::Stage => "stage",
            RequestCategory::Inline => "inline",
            RequestCategory::Countdown => "countdown",
        }
    }
}

/// Counter bucket for one `(chat_id, round_id)`. Mirrors
/// `request_tracker.py::RequestStats` field-for-field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub turn: u32,
    pub stage: u32,
    pub inline: u32,
    pub countdown: u32,
}

impl RequestStats {
    pub fn total(&self) -> u32 {
        self.turn + self.stage + self.inline + self.countdown
    }

    fn increment(&mut self, category: RequestCategory) {
        let field = match category {
            RequestCategory::Turn => &mut self.turn,
            RequestCategory::Stage => &mut self.stage,
            RequestCategory::Inline => &mut self.inline,
            RequestCategory::Countdown => &mut self.countdown,
        };
        *field += 1;
    }

    fn decrement(&mut self, category: RequestCategory) {
        let field = match category {
            RequestCategory::Turn => &mut self.turn,
            RequestCategory::Stage => &mut self.stage,
            RequestCategory::Inline => &mut self.inline,
            RequestCategory::Countdown => &mut self.countdown,
        };
        *field = field.saturating_sub(1);
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp_epoch_seconds: i64,
    pub category: RequestCategory,
    pub stats: RequestStats,
}

type Key = (i64, String);

struct Inner {
    stats: HashMap<Key, RequestStats>,
    history: HashMap<Key, Vec<HistoryEntry>>,
}

/// Concurrency-safe accounting for message-related outbound requests, one
/// budget per `(chat_id, round_id)`. A missing `round_id` (no hand in
/// progress yet) is treated as untracked and always allowed, matching the
/// original's behavior for out-of-round calls.
pub struct RequestBudgetTracker {
    limit: u32,
    info_threshold: Option<u32>,
    inner: tokio::sync::Mutex<Inner>,
}

impl RequestBudgetTracker {
    pub fn new(limit: u32, info_threshold: Option<f64>) -> Result<Self, BudgetError> {
        let info_threshold = match info_threshold {
            None => None,
            Some(_) if limit == 0 => None,
            Some(fraction) => {
                if !(0.0 < fraction && fraction <= 1.0) {
                    return Err(BudgetError::InvalidInfoThreshold);
                }
                let raw = (limit as f64 * fraction).ceil() as u32;
                Some(raw.clamp(1, limit))
            }
        };
        Ok(Self {
            limit,
            info_threshold,
            inner: tokio::sync::Mutex::new(Inner {
                stats: HashMap::new(),
                history: HashMap::new(),
            }),
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn verbose_logging_enabled() -> bool {
        std::env::var(VERBOSE_ENV_VAR)
            .map(|raw| matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    /// Attempts to reserve room in the `(chat_id, round_id)` budget for
    /// `category`. Returns `false` without mutating state if the total
    /// would exceed `limit`.
    pub async fn try_consume(
        &self,
        chat_id: i64,
        round_id: Option<&str>,
        category: RequestCategory,
    ) -> bool {
        let Some(round_id) = round_id else {
            return true;
        };
        let key = (chat_id, round_id.to_string());
        let mut inner = self.inner.lock().await;
        let stats = inner.stats.entry(key.clone()).or_default();
        let prior_total = stats.total();
        if prior_total >= self.limit {
            tracing::info!(chat_id, round_id, category = category.as_str(), limit = self.limit, "request budget exhausted");
            return false;
        }
        stats.increment(category);
        let current_total = stats.total();
        let snapshot = *stats;

        inner.history.entry(key).or_default().push(HistoryEntry {
            timestamp_epoch_seconds: poker_core_epoch_seconds(),
            category,
            stats: snapshot,
        });

        if let Some(threshold) = self.info_threshold {
            if prior_total < threshold && threshold <= current_total {
                tracing::info!(
                    chat_id,
                    round_id,
                    category = category.as_str(),
                    total = current_total,
                    limit = self.limit,
                    "request budget nearing limit"
                );
            }
        }
        if Self::verbose_logging_enabled() {
            tracing::info!(
                chat_id,
                round_id,
                category = category.as_str(),
                total = current_total,
                "request reservation (verbose)"
            );
        }
        true
    }

    /// Undoes a previously reserved request when no outbound call was
    /// actually made, never letting any counter go below zero.
    pub async fn release(&self, chat_id: i64, round_id: Option<&str>, category: RequestCategory) {
        let Some(round_id) = round_id else {
            return;
        };
        let key = (chat_id, round_id.to_string());
        let mut inner = self.inner.lock().await;
        if let Some(stats) = inner.stats.get_mut(&key) {
            stats.decrement(category);
        }
    }

    pub async fn snapshot(&self, chat_id: i64, round_id: Option<&str>) -> RequestStats {
        let Some(round_id) = round_id else {
            return RequestStats::default();
        };
        let key = (chat_id, round_id.to_string());
        let inner = self.inner.lock().await;
        inner.stats.get(&key).copied().unwrap_or_default()
    }

    pub async fn reset(&self, chat_id: i64, round_id: Option<&str>) {
        let Some(round_id) = round_id else {
            return;
        };
        let key = (chat_id, round_id.to_string());
        let mut inner = self.inner.lock().await;
        inner.stats.remove(&key);
        inner.history.remove(&key);
    }

    pub async fn history(&self, chat_id: i64, round_id: Option<&str>) -> Vec<HistoryEntry> {
        let Some(round_id) = round_id else {
            return Vec::new();
        };
        let key = (chat_id, round_id.to_string());
        let inner = self.inner.lock().await;
        inner.history.get(&key).cloned().unwrap_or_default()
    }
}

fn poker_core_epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
