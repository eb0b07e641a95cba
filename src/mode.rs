//! Cache modes: how a single read interacts with the second-level cache.

use std::fmt;

/// Cache interaction mode for a load or query.
///
/// # Example
///
/// ```
/// use orm_cache::mode::CacheMode;
///
/// assert!(CacheMode::Normal.reads() && CacheMode::Normal.writes());
/// assert!(!CacheMode::Refresh.reads());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// Read from cache, populate it on miss.
    #[default]
    Normal,

    /// Read from cache only; never write loaded data back.
    Get,

    /// Never read from cache; write loaded data.
    Put,

    /// Skip the cache read and overwrite whatever is cached.
    ///
    /// Also forces already-managed instances to be refreshed.
    Refresh,
}

impl CacheMode {
    pub fn reads(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub fn writes(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }

    pub fn is_refresh(self) -> bool {
        matches!(self, CacheMode::Refresh)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Normal => write!(f, "Normal"),
            CacheMode::Get => write!(f, "Get"),
            CacheMode::Put => write!(f, "Put"),
            CacheMode::Refresh => write!(f, "Refresh"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_matrix() {
        assert!(CacheMode::Get.reads());
        assert!(!CacheMode::Get.writes());
        assert!(!CacheMode::Put.reads());
        assert!(CacheMode::Put.writes());
        assert!(CacheMode::Refresh.writes());
        assert!(CacheMode::Refresh.is_refresh());
        assert!(!CacheMode::Normal.is_refresh());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(CacheMode::default().to_string(), "Normal");
        assert_eq!(CacheMode::Refresh.to_string(), "Refresh");
    }
}
