use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum allowed page size (4 KiB).
///
/// Pages smaller than the smallest common OS page cannot be mapped
/// efficiently and would explode the page-file count.
const PAGE_SIZE_MIN_LIMIT: u64 = 4 * 1024;

/// Maximum allowed page size (1 GiB).
///
/// Bounded well below `u32::MAX` so that an in-page offset always fits
/// a u32 and a single page maps comfortably.
const PAGE_SIZE_MAX_LIMIT: u64 = 1024 * 1024 * 1024;

/// Default number of reader tables sized from `concurrency_level`.
const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// Returns the OS page size in bytes.
pub(crate) fn os_page_size() -> u64 {
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 { PAGE_SIZE_MIN_LIMIT } else { raw as u64 }
}

/// Rounds a requested page size up to a power of two inside
/// `[min, max]`.
///
/// Page sizes only ever round up: a caller asking for N bytes per
/// page must fit N-byte offsets in that page, and both bounds are
/// powers of two, so `next_power_of_two` after clamping cannot
/// overshoot `max`.
#[inline]
fn round_up_page_size(requested: u64, min: u64, max: u64) -> u64 {
    debug_assert!(min.is_power_of_two() && max.is_power_of_two() && min <= max);
    requested.clamp(min, max).next_power_of_two().min(max)
}

/// Logical identifier for a page file.
///
/// Page ids index the concatenated address space: page `p` covers the
/// byte range `[p * page_size, (p + 1) * page_size)`. They are dense,
/// non-negative, and name the backing file under `pages/`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageId(pub u32);

impl PageId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Returns the next page id in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u32> for PageId {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 16-byte cluster member identity used for the voted-for record.
///
/// An all-zero identity means "no vote cast"; [`NodeId::none`] and
/// [`NodeId::as_option`] translate between the wire form and
/// `Option<NodeId>` at the API surface.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    pub const fn new(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    /// The all-zero identity standing in for "no vote".
    pub const fn none() -> Self {
        Self([0u8; 16])
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Maps the all-zero identity to `None`.
    pub fn as_option(self) -> Option<NodeId> {
        if self.is_none() { None } else { Some(self) }
    }
}

impl From<Option<NodeId>> for NodeId {
    fn from(value: Option<NodeId>) -> Self {
        value.unwrap_or_else(NodeId::none)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Selects the backing for page memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Pages are memory-mapped views of their files; the OS owns
    /// writeback and `msync` provides durability.
    SharedMemory,

    /// Pages live in private anonymous buffers (huge-page advised when
    /// the platform allows) and are written out explicitly on flush.
    PrivateMemory,
}

impl Default for MemoryMode {
    fn default() -> Self {
        Self::SharedMemory
    }
}

/// Governs when dirty tail bytes are made durable outside of commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushInterval {
    /// Only explicit `flush()` calls and the commit path flush.
    Never,

    /// Every commit flushes; no background timer runs. This is the
    /// baseline durability contract spelled out explicitly.
    Zero,

    /// A background worker additionally flushes the dirty tail every
    /// `millis` milliseconds.
    Every { millis: u64 },
}

impl FlushInterval {
    pub fn period(&self) -> Option<Duration> {
        match self {
            FlushInterval::Every { millis } => Some(Duration::from_millis((*millis).max(1))),
            _ => None,
        }
    }
}

impl Default for FlushInterval {
    fn default() -> Self {
        Self::Zero
    }
}

/// Primary configuration surface for a WAL instance.
///
/// # Example
///
/// ```rust
/// use keel_wal::{WalConfig, MemoryMode};
/// use std::path::PathBuf;
///
/// let config = WalConfig {
///     root_dir: PathBuf::from("/data/wal"),
///     chunk_size: 64 * 1024,
///     memory: MemoryMode::PrivateMemory,
///     ..WalConfig::default()
/// }
/// .normalized();
/// assert!(config.chunk_size.is_power_of_two());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Root directory that contains `metadata`, `index` and `pages/`.
    pub root_dir: PathBuf,

    /// Page size in bytes. Rounded up to the OS page size and to a
    /// power of two by [`WalConfig::normalized`]. Zero selects the OS
    /// page size.
    pub chunk_size: u64,

    /// Sizing hint for internal tables (reader registries, context
    /// maps). Not a hard limit.
    pub concurrency_level: usize,

    /// Background flush cadence for the dirty tail.
    pub flush_interval: FlushInterval,

    /// Backing store for page memory.
    pub memory: MemoryMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/wal"),
            chunk_size: 0,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            flush_interval: FlushInterval::default(),
            memory: MemoryMode::default(),
        }
    }
}

impl WalConfig {
    /// Returns a copy of the configuration with the page size rounded
    /// into the supported power-of-two window and zero values replaced
    /// with defaults.
    pub fn normalized(mut self) -> Self {
        let os_page = os_page_size();
        let raw = if self.chunk_size == 0 {
            os_page
        } else {
            self.chunk_size
        };
        self.chunk_size = round_up_page_size(
            raw.max(os_page),
            PAGE_SIZE_MIN_LIMIT.max(os_page),
            PAGE_SIZE_MAX_LIMIT,
        );

        if self.concurrency_level == 0 {
            self.concurrency_level = DEFAULT_CONCURRENCY_LEVEL;
        }

        self
    }
}

impl Display for WalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WalConfig(root_dir={:?}, chunk_size={}, concurrency_level={}, flush_interval={:?}, memory={:?})",
            self.root_dir, self.chunk_size, self.concurrency_level, self.flush_interval, self.memory
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = WalConfig::default().normalized();
        assert!(cfg.chunk_size.is_power_of_two());
        assert!(cfg.chunk_size >= os_page_size());
        assert!(cfg.concurrency_level > 0);
    }

    #[test]
    fn normalized_rounds_page_size_up() {
        let cfg = WalConfig {
            chunk_size: 5000,
            ..WalConfig::default()
        }
        .normalized();
        assert!(cfg.chunk_size.is_power_of_two());
        assert!(cfg.chunk_size >= 5000);
        assert!(cfg.chunk_size >= os_page_size());

        let huge = WalConfig {
            chunk_size: u64::MAX,
            ..WalConfig::default()
        }
        .normalized();
        assert_eq!(huge.chunk_size, PAGE_SIZE_MAX_LIMIT);
    }

    #[test]
    fn round_up_page_size_respects_bounds() {
        assert_eq!(round_up_page_size(5000, 4096, 1 << 30), 8192);
        assert_eq!(round_up_page_size(4096, 4096, 1 << 30), 4096);
        assert_eq!(round_up_page_size(0, 4096, 1 << 30), 4096);
        assert_eq!(round_up_page_size(u64::MAX, 4096, 1 << 30), 1 << 30);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = WalConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: WalConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn node_id_none_round_trip() {
        assert!(NodeId::none().is_none());
        assert_eq!(NodeId::none().as_option(), None);
        let id = NodeId::new([7u8; 16]);
        assert_eq!(id.as_option(), Some(id));
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn page_id_next() {
        let id = PageId::new(41);
        assert_eq!(PageId::new(42), id.next());
    }

    #[test]
    fn flush_interval_period() {
        assert_eq!(FlushInterval::Never.period(), None);
        assert_eq!(FlushInterval::Zero.period(), None);
        assert_eq!(
            FlushInterval::Every { millis: 25 }.period(),
            Some(Duration::from_millis(25))
        );
    }
}
