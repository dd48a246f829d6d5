//! Ambient locale handling.
//!
//! The active locale is task-local: a dispatch scopes it around one notifiable's
//! channel loop and the previous value comes back on every exit path, including
//! errors and panics. Concurrent dispatches on other tasks never observe it.

use std::future::Future;
use std::sync::LazyLock;

use parking_lot::RwLock;

/// Locale used when nothing else is in scope.
pub const DEFAULT_LOCALE: &str = "en";

static PROCESS_DEFAULT: LazyLock<RwLock<String>> =
    LazyLock::new(|| RwLock::new(DEFAULT_LOCALE.to_string()));

tokio::task_local! {
    static ACTIVE_LOCALE: String;
}

/// The locale currently in effect for this task.
pub fn current() -> String {
    ACTIVE_LOCALE
        .try_with(|locale| locale.clone())
        .unwrap_or_else(|_| default_locale())
}

/// Process-wide fallback locale.
pub fn default_locale() -> String {
    PROCESS_DEFAULT.read().clone()
}

/// Replace the process-wide fallback locale. Intended for process start.
pub fn set_default_locale(locale: impl Into<String>) {
    *PROCESS_DEFAULT.write() = locale.into();
}

/// Run `fut` with `locale` active. `None` leaves the ambient locale untouched.
pub async fn scope<F>(locale: Option<String>, fut: F) -> F::Output
where
    F: Future,
{
    match locale {
        Some(locale) => ACTIVE_LOCALE.scope(locale, fut).await,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_restores_previous_locale() {
        let outside = current();

        let inside = scope(Some("fr".to_string()), async {
            let first = current();
            let nested = scope(Some("de".to_string()), async { current() }).await;
            (first, nested, current())
        })
        .await;

        assert_eq!(inside, ("fr".to_string(), "de".to_string(), "fr".to_string()));
        assert_eq!(current(), outside);
    }

    #[tokio::test]
    async fn test_scope_restores_after_error() {
        let result: Result<(), &str> = scope(Some("ja".to_string()), async {
            assert_eq!(current(), "ja");
            Err("channel failed")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(current(), default_locale());
    }

    #[tokio::test]
    async fn test_none_keeps_ambient_locale() {
        let locale = scope(Some("es".to_string()), async {
            scope(None, async { current() }).await
        })
        .await;
        assert_eq!(locale, "es");
    }
}
