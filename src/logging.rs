//! Compile-time gated debug logging for the runtime.

/// Emit interpreter debug logs only when the `rt_debug_logs` Cargo feature is
/// enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments.
#[macro_export]
macro_rules! rt_debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "rt_debug_logs")]
        {
            eprintln!($($arg)*);
        }
        #[cfg(not(feature = "rt_debug_logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
