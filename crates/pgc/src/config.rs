//! Configuration Module - GC Tuning Parameters
//!
//! Manages all configuration parameters for PGC. The configuration is
//! passed to [`GarbageCollector::new`](crate::GarbageCollector::new) and
//! stays immutable for the lifetime of the collector.

/// Response to a mark packet pool overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OverflowPolicy {
    /// Fail the collection with [`GcError::MarkingOverflow`](crate::GcError::MarkingOverflow)
    Fail,
    /// Clear all marks and re-trace the heap with an unbounded serial mark stack
    SerialFallback,
}

/// Main configuration for the precise garbage collector
///
/// # Examples
///
/// ```rust
/// use pgc::GcConfig;
///
/// let config = GcConfig {
///     concurrent: false,
///     gc_threads: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Heap limit at startup in bytes
    ///
    /// Growing past the limit triggers a collection, then a heap expansion.
    /// Default: 4MB
    pub initial_heap_limit: usize,

    /// Maximum heap size in bytes
    ///
    /// Hard cap for heap expansion.
    /// Default: 1/2 of physical memory, at most 32GB
    pub max_heap_size: usize,

    /// Heap occupancy ratio (0.0 - 1.0) that launches concurrent marking
    ///
    /// Only used when `concurrent` is enabled.
    /// Default: 0.6
    pub marking_threshold: f64,

    /// Number of threads in the parallel collect/fix pool
    ///
    /// Default: number of CPUs
    pub gc_threads: usize,

    /// Number of concurrent marker threads
    ///
    /// If None, uses max(1, gc_threads - 1).
    pub marker_threads: Option<usize>,

    /// Enable two-finger compaction of small-object chunks
    ///
    /// Default: true
    pub compacting: bool,

    /// Enable concurrent (incremental) marking
    ///
    /// When disabled every collection marks with the world stopped.
    /// Default: true
    pub concurrent: bool,

    /// Number of mark packets shared by the marker threads
    ///
    /// Default: 256
    pub packet_count: usize,

    /// What to do when the mark packet pool overflows
    ///
    /// Default: SerialFallback
    pub overflow_policy: OverflowPolicy,

    /// Enable verbose GC logging to the console
    ///
    /// Default: false
    pub verbose: bool,

    /// Enable GC statistics collection
    ///
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        let total_memory = get_total_memory();

        GcConfig {
            // Heap size
            initial_heap_limit: 4 * MB,
            max_heap_size: calculate_max_heap(total_memory),
            marking_threshold: 0.6,

            // Threading
            gc_threads: num_cpus.max(1),
            marker_threads: None,

            // Algorithms
            compacting: true,
            concurrent: true,
            packet_count: 256,
            overflow_policy: OverflowPolicy::SerialFallback,

            // Debug
            verbose: false,
            stats_enabled: true,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_heap_limit == 0 {
            return Err(ConfigError::InvalidHeapSize(
                "initial_heap_limit must be > 0".to_string(),
            ));
        }

        if self.initial_heap_limit > self.max_heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "initial_heap_limit cannot exceed max_heap_size".to_string(),
            ));
        }

        if !(self.marking_threshold > 0.0 && self.marking_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(
                "marking_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.gc_threads == 0 {
            return Err(ConfigError::InvalidGcThreads(
                "gc_threads must be > 0".to_string(),
            ));
        }

        if self.marker_threads == Some(0) {
            return Err(ConfigError::InvalidGcThreads(
                "marker_threads must be > 0".to_string(),
            ));
        }

        if self.packet_count < 2 {
            return Err(ConfigError::InvalidPacketCount(
                "packet_count must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of concurrent marker threads to spawn
    pub fn marker_threads(&self) -> usize {
        self.marker_threads
            .unwrap_or_else(|| self.gc_threads.saturating_sub(1))
            .max(1)
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - PGC_INITIAL_HEAP
    /// - PGC_MAX_HEAP
    /// - PGC_MARK_THRESHOLD
    /// - PGC_GC_THREADS
    /// - PGC_COMPACTING
    /// - PGC_CONCURRENT
    /// - PGC_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export PGC_MAX_HEAP=4294967296  # 4GB
    /// export PGC_CONCURRENT=0
    /// export PGC_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("PGC_INITIAL_HEAP") {
            config.initial_heap_limit = size;
        }

        if let Some(size) = env_parse::<usize>("PGC_MAX_HEAP") {
            config.max_heap_size = size;
        }

        if let Some(ratio) = env_parse::<f64>("PGC_MARK_THRESHOLD") {
            config.marking_threshold = ratio;
        }

        if let Some(threads) = env_parse::<usize>("PGC_GC_THREADS") {
            config.gc_threads = threads;
        }

        if let Some(flag) = env_flag("PGC_COMPACTING") {
            config.compacting = flag;
        }

        if let Some(flag) = env_flag("PGC_CONCURRENT") {
            config.concurrent = flag;
        }

        if let Some(flag) = env_flag("PGC_VERBOSE") {
            config.verbose = flag;
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),

    #[error("Invalid packet count: {0}")]
    InvalidPacketCount(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;
pub const GB: usize = 1024 * 1024 * 1024;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    Some(val == "1" || val.eq_ignore_ascii_case("true"))
}

/// Get total physical memory in bytes
fn get_total_memory() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if line.starts_with("MemTotal:") {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() >= 2 {
                        if let Ok(kb) = parts[1].parse::<usize>() {
                            return kb * KB;
                        }
                    }
                }
            }
        }
    }

    8 * GB
}

fn calculate_max_heap(total_memory: usize) -> usize {
    (total_memory / 2).clamp(64 * MB, 32 * GB)
}
