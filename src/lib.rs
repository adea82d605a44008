// Copyright (c) 2025 Monmouth Contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

#![warn(missing_debug_implementations, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod error_handling;
pub mod events;
pub mod monitoring;
pub mod performance;

use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub use config::EngineConfig;
pub use engine::{OptimizationEngine, SystemHealth, TtlPolicy};
pub use error_handling::{CircuitBreakerError, OptimizationError};
pub use events::{EventBus, EventPayload, EventPriority, EventType, SystemEvent};
pub use monitoring::{HealthStatus, MetricUnit, PerformanceMonitor};
pub use performance::{IntelligentCache, JsonCodec};

/// Longest lifetime any cache entry or breaker cool-down can be given.
pub const MAX_DEADLINE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `now + duration`, saturating at `now + MAX_DEADLINE`.
pub(crate) fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(MAX_DEADLINE)).unwrap_or(now)
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// Intended for composition roots; the library itself never installs a subscriber.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
