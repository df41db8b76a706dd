//! GC Logging and Tracing
//!
//! Structured event log for collector operations, useful for:
//! - Performance analysis
//! - Debugging
//! - Production monitoring
//!
//! Events are kept in a bounded in-memory buffer and optionally echoed to
//! the console, human-readable or as JSON. Plain diagnostics go through the
//! `log` facade instead.
//!
//! Log Levels:
//! - ERROR: allocation failures
//! - WARN: mark overflow, heap expansion
//! - INFO: GC cycles, heap statistics
//! - DEBUG: phases, pauses, thread registration

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::OverflowPolicy;

/// Events retained by a logger
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Log level for GC events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// GC cycle started
    CycleStart {
        cycle: u64,
        kind: String,
        reason: String,
    },

    /// GC phase started
    PhaseStart { cycle: u64, phase: String },

    /// GC phase completed
    PhaseEnd {
        cycle: u64,
        phase: String,
        duration_ms: f64,
    },

    /// GC cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        freed_bytes: usize,
        copied_bytes: usize,
    },

    /// Heap statistics after a collection
    HeapStats {
        heap_size: usize,
        heap_limit: usize,
        live_bytes: usize,
        residency: f64,
    },

    /// World stopped
    Pause {
        cycle: u64,
        duration_us: u64,
        threads: usize,
    },

    /// Allocation failed after collection and expansion
    AllocationFailure { size: usize, heap_size: usize },

    /// Mark packet pool overflowed
    MarkOverflow { cycle: u64, policy: OverflowPolicy },

    /// Mutator thread registered
    ThreadRegistered {
        #[serde(serialize_with = "serialize_thread_id")]
        thread: ThreadId,
    },

    /// Mutator thread deregistered
    ThreadDeregistered {
        #[serde(serialize_with = "serialize_thread_id")]
        thread: ThreadId,
    },

    /// Heap limit raised
    HeapExpanded { old_limit: usize, new_limit: usize },
}

fn serialize_thread_id<S: serde::Serializer>(id: &ThreadId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:?}", id))
}

impl GcEvent {
    /// Log level of this event
    pub fn level(&self) -> LogLevel {
        match self {
            GcEvent::AllocationFailure { .. } => LogLevel::Error,
            GcEvent::MarkOverflow { .. } | GcEvent::HeapExpanded { .. } => LogLevel::Warn,
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } | GcEvent::HeapStats { .. } => {
                LogLevel::Info
            },
            GcEvent::PhaseStart { .. }
            | GcEvent::PhaseEnd { .. }
            | GcEvent::Pause { .. }
            | GcEvent::ThreadRegistered { .. }
            | GcEvent::ThreadDeregistered { .. } => LogLevel::Debug,
        }
    }
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Events kept in memory
    pub capacity: usize,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// GC Logger - centralized event log
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<VecDeque<(DateTime<Local>, GcEvent)>>,
    enabled: AtomicBool,
}

impl GcLogger {
    /// Create new GC logger
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.capacity.min(DEFAULT_EVENT_CAPACITY))),
            config,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() || event.level() > self.config.level {
            return;
        }

        let timestamp = Local::now();
        if self.config.console {
            self.output_console(&timestamp, &event);
        }

        let mut events = self.events.lock();
        if self.config.capacity == 0 {
            return;
        }
        while events.len() >= self.config.capacity {
            events.pop_front();
        }
        events.push_back((timestamp, event));
    }

    fn output_console(&self, timestamp: &DateTime<Local>, event: &GcEvent) {
        let line = if self.config.json {
            match serde_json::to_string(event) {
                Ok(json) => json,
                Err(err) => {
                    log::error!("failed to serialize GC event: {}", err);
                    return;
                }
            }
        } else {
            Self::format_human(event)
        };

        if self.config.timestamps {
            println!("[{}] {}", timestamp.format("%Y-%m-%d %H:%M:%S%.3f"), line);
        } else {
            println!("{}", line);
        }
    }

    /// Render an event in human-readable form
    pub fn format_human(event: &GcEvent) -> String {
        match event {
            GcEvent::CycleStart { cycle, kind, reason } => {
                format!("[GC] Cycle {} started ({}, reason: {})", cycle, kind, reason)
            },
            GcEvent::PhaseStart { cycle, phase } => {
                format!("[GC] Cycle {}: {} phase started", cycle, phase)
            },
            GcEvent::PhaseEnd {
                cycle,
                phase,
                duration_ms,
            } => format!(
                "[GC] Cycle {}: {} phase completed ({:.2}ms)",
                cycle, phase, duration_ms
            ),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                freed_bytes,
                copied_bytes,
            } => format!(
                "[GC] Cycle {} completed ({:.2}ms, freed {} bytes, copied {} bytes)",
                cycle, duration_ms, freed_bytes, copied_bytes
            ),
            GcEvent::HeapStats {
                heap_size,
                heap_limit,
                live_bytes,
                residency,
            } => format!(
                "[GC] Heap: {}/{} bytes, {} live ({:.1}% residency)",
                heap_size,
                heap_limit,
                live_bytes,
                residency * 100.0
            ),
            GcEvent::Pause {
                cycle,
                duration_us,
                threads,
            } => format!(
                "[GC] Cycle {}: pause {} us, {} threads stopped",
                cycle, duration_us, threads
            ),
            GcEvent::AllocationFailure { size, heap_size } => format!(
                "[GC] Allocation failure: {} bytes (heap size: {})",
                size, heap_size
            ),
            GcEvent::MarkOverflow { cycle, policy } => format!(
                "[GC] Cycle {}: mark packets overflowed (policy: {:?})",
                cycle, policy
            ),
            GcEvent::ThreadRegistered { thread } => format!("[GC] Thread {:?} registered", thread),
            GcEvent::ThreadDeregistered { thread } => {
                format!("[GC] Thread {:?} deregistered", thread)
            },
            GcEvent::HeapExpanded {
                old_limit,
                new_limit,
            } => format!("[GC] Heap limit expanded {} -> {} bytes", old_limit, new_limit),
        }
    }

    /// Copy of the retained events, oldest first
    pub fn events(&self) -> Vec<(DateTime<Local>, GcEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<GcLogger> = Mutex::new(GcLogger::default());
}

/// Log a GC event to the global logger
pub fn log_event(event: GcEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Replace the global logger
pub fn configure_logger(config: GcLoggerConfig) {
    *GLOBAL_LOGGER.lock() = GcLogger::new(config);
}

/// Events retained by the global logger, oldest first
pub fn recent_events() -> Vec<GcEvent> {
    GLOBAL_LOGGER
        .lock()
        .events()
        .into_iter()
        .map(|(_, event)| event)
        .collect()
}
