//! Contract with the GUI layer.
//!
//! The storage core never renders anything itself; the two calls below are
//! the entire surface it needs from the embedding application.

/// User-facing prompt sink supplied by the embedding application.
pub trait Gui {
    /// Show a warning and ask whether to retry. `true` means "try again".
    fn warn(&self, msg: &str) -> bool;

    /// Report an unrecoverable condition and terminate the process.
    fn fatal(&self, msg: &str) -> !;
}

/// Headless implementation for tools and tests: never retries, aborts on
/// fatal conditions.
pub struct NoGui;

impl Gui for NoGui {
    fn warn(&self, msg: &str) -> bool {
        tracing::warn!("{msg}");
        false
    }

    fn fatal(&self, msg: &str) -> ! {
        tracing::error!("{msg}");
        std::process::abort();
    }
}
