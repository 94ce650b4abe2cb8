//! Per-tool rate limiting for the credit consumption API.
//!
//! Process-scoped, in-memory sliding window. Constructed explicitly and
//! carried in application state; there is no global static, so tests and
//! multi-instance deployments each own their limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

/// Default per-tool consume budget per minute.
const DEFAULT_LIMIT_PER_MINUTE: u32 = 300;

/// Window length for the sliding count.
const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// The limit applied to this key.
    pub limit: u32,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window.
    /// Only meaningful when `allowed` is false.
    pub retry_after_seconds: u64,
}

/// Sliding-window request counter keyed by tool id.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<Uuid, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Count one request against `tool_id` and report whether it fits the
    /// window. `limit` overrides the default budget (e.g. per-tool tiers).
    pub async fn check_tool(&self, tool_id: Uuid, limit: Option<u32>) -> RateLimitResult {
        let limit = limit.unwrap_or(DEFAULT_LIMIT_PER_MINUTE).max(1);
        let now = Instant::now();

        let mut windows = self.windows.write().await;
        let window = windows.entry(tool_id).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit as usize {
            let retry_after_seconds = window
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)).as_secs() + 1)
                .unwrap_or(1);
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_seconds,
            };
        }

        window.push_back(now);
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit - window.len() as u32,
            retry_after_seconds: 0,
        }
    }

    /// Drop the window for a tool (admin reset, tests).
    pub async fn reset_tool(&self, tool_id: Uuid) {
        self.windows.write().await.remove(&tool_id);
    }
}
