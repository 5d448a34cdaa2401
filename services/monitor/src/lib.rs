//! slotwatch monitor
//!
//! Polls a rate-limited allocation API for open acceptance slots on behalf
//! of the watched data sets and pushes change-only notifications to chat
//! subscribers.
//!
//! ## Architecture
//!
//! ```text
//! CancellableLoop (scheduler)
//! └── PollCycleRunner (cycle)
//!     ├── DatasetSource      (refresh, once per window)
//!     ├── RetryingCaller     -> AllocationApi
//!     ├── QuotaBook / LatencyTracker / AdaptivePacer  (slotwatch-pacing)
//!     └── ChangeNotifier     -> NotificationSink, SubscriberRegistry
//! CommandBot (bot)           -> SubscriberRegistry
//! ```
//!
//! The scheduler runs on one task; the subscriber registry is the only state
//! it shares with the bot loop.

pub mod allocation;
pub mod bot;
pub mod config;
pub mod cycle;
pub mod model;
pub mod notifier;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod subscribers;
pub mod telegram;
