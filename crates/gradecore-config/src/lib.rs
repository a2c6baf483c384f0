//! Scoped, per-task configuration overrides.
//!
//! `cache_level`, `compression_level`, `use_compression`, and `check_integrity`
//! are never process globals. Each lives in its own stack of overrides; entering a
//! scope pushes a value onto that stack, and dropping the returned guard pops it.
//! The active value is always the top of the stack, falling back to a crate-level
//! default when the stack is empty.
//!
//! This mirrors a `with grading_context.cache_level(LEVEL):` context manager, just
//! expressed as an RAII guard instead of a `with`-block.

use std::cell::RefCell;

/// How aggressively the dependency cache (C7) should memoize a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    /// Always miss; the block body always runs and nothing is ever stored.
    NoCache,
    /// Entries live in a per-process, per-scope SQLite database discarded at exit.
    CacheTransiently,
    /// Only compile-style blocks cache; `run`-style blocks inside them are forced
    /// to [`CacheLevel::NoCache`] by the caller (C6 enforces this, not this crate).
    CacheCompilation,
    /// Full persistent caching.
    CacheAll,
}

impl Default for CacheLevel {
    fn default() -> Self {
        Self::CacheAll
    }
}

/// The compression level used by the reference implementation's blob store
/// when none is overridden.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 5;

thread_local! {
    static CACHE_LEVEL_STACK: RefCell<Vec<CacheLevel>> = const { RefCell::new(Vec::new()) };
    static COMPRESSION_LEVEL_STACK: RefCell<Vec<i32>> = const { RefCell::new(Vec::new()) };
    static USE_COMPRESSION_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static CHECK_INTEGRITY_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
}

macro_rules! scoped_override {
    ($stack:ident, $value_ty:ty, $default:expr, $getter:ident, $guard:ident, $enter:ident) => {
        /// Returns the value currently in effect: the top of the override stack,
        /// or the crate default if the stack is empty.
        #[must_use]
        pub fn $getter() -> $value_ty {
            $stack.with(|s| s.borrow().last().copied().unwrap_or($default))
        }

        /// An active override. Popped from the stack when dropped, restoring
        /// whatever was in effect before it was entered.
        #[must_use = "the override is only in effect while this guard is alive"]
        pub struct $guard {
            _private: (),
        }

        impl Drop for $guard {
            fn drop(&mut self) {
                $stack.with(|s| {
                    s.borrow_mut().pop();
                });
            }
        }

        /// Pushes `value` onto the override stack for the lifetime of the
        /// returned guard.
        #[must_use = "the override is only in effect while the guard is alive"]
        pub fn $enter(value: $value_ty) -> $guard {
            $stack.with(|s| s.borrow_mut().push(value));
            $guard { _private: () }
        }
    };
}

scoped_override!(
    CACHE_LEVEL_STACK,
    CacheLevel,
    CacheLevel::default(),
    cache_level,
    CacheLevelGuard,
    enter_cache_level
);

scoped_override!(
    COMPRESSION_LEVEL_STACK,
    i32,
    DEFAULT_COMPRESSION_LEVEL,
    compression_level,
    CompressionLevelGuard,
    enter_compression_level
);

scoped_override!(
    USE_COMPRESSION_STACK,
    bool,
    true,
    use_compression,
    UseCompressionGuard,
    enter_use_compression
);

scoped_override!(
    CHECK_INTEGRITY_STACK,
    bool,
    true,
    check_integrity,
    CheckIntegrityGuard,
    enter_check_integrity
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_empty_stack() {
        assert_eq!(cache_level(), CacheLevel::CacheAll);
        assert_eq!(compression_level(), DEFAULT_COMPRESSION_LEVEL);
        assert!(use_compression());
        assert!(check_integrity());
    }

    #[test]
    fn guard_restores_previous_value_on_drop() {
        assert_eq!(cache_level(), CacheLevel::CacheAll);
        {
            let _outer = enter_cache_level(CacheLevel::CacheAll);
            assert_eq!(cache_level(), CacheLevel::CacheAll);
            {
                let _inner = enter_cache_level(CacheLevel::NoCache);
                assert_eq!(cache_level(), CacheLevel::NoCache);
            }
            assert_eq!(cache_level(), CacheLevel::CacheAll);
        }
        assert_eq!(cache_level(), CacheLevel::CacheAll);
    }

    #[test]
    fn independent_overrides_do_not_interfere() {
        let _level = enter_cache_level(CacheLevel::NoCache);
        let _compression = enter_use_compression(false);
        assert_eq!(cache_level(), CacheLevel::NoCache);
        assert!(!use_compression());
        assert!(check_integrity());
    }
}
