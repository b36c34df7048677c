//! # Reporting hooks for signals that cannot be delivered.
//!
//! Two situations end up here:
//! - **Dropped signals**: an item or error arrives after the subscription has
//!   terminated or been cancelled. Per-subscription hooks can be installed in
//!   the [`Context`] (the test harness does this); without one the drop is
//!   logged with `tracing::warn!`.
//! - **Unhandled errors**: an error reaches a subscriber that has no error
//!   callback. It is logged with `tracing::error!` and passed to the global
//!   hook, if one is installed. Errors are never silently swallowed.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::context::{keys, Context};
use crate::error::FluxError;

/// Receives an item dropped after termination.
pub type NextDroppedHook = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Receives an error dropped after termination.
pub type ErrorDroppedHook = Arc<dyn Fn(FluxError) + Send + Sync>;

/// Receives errors that reached a subscriber without an error callback.
pub type UnhandledErrorHook = Arc<dyn Fn(&FluxError) + Send + Sync>;

fn unhandled_slot() -> &'static RwLock<Option<UnhandledErrorHook>> {
    static SLOT: OnceLock<RwLock<Option<UnhandledErrorHook>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide unhandled-error hook, replacing the previous one.
pub fn set_unhandled_error_hook(hook: impl Fn(&FluxError) + Send + Sync + 'static) {
    *unhandled_slot().write() = Some(Arc::new(hook));
}

/// Removes the process-wide unhandled-error hook.
pub fn reset_unhandled_error_hook() {
    *unhandled_slot().write() = None;
}

/// Returns `cx` extended with per-subscription dropped-signal hooks.
pub fn with_dropped_hooks(
    cx: &Context,
    on_next: impl Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    on_error: impl Fn(FluxError) + Send + Sync + 'static,
) -> Context {
    let next: NextDroppedHook = Arc::new(on_next);
    let error: ErrorDroppedHook = Arc::new(on_error);
    cx.put_reserved(keys::ON_NEXT_DROPPED, next)
        .put_reserved(keys::ON_ERROR_DROPPED, error)
}

pub(crate) fn on_next_dropped<T: Send + 'static>(item: T, cx: &Context) {
    match cx.get_reserved::<NextDroppedHook>(keys::ON_NEXT_DROPPED) {
        Some(hook) => hook(Box::new(item)),
        None => tracing::warn!(
            item_type = std::any::type_name::<T>(),
            "item dropped after termination"
        ),
    }
}

pub(crate) fn on_error_dropped(error: FluxError, cx: &Context) {
    match cx.get_reserved::<ErrorDroppedHook>(keys::ON_ERROR_DROPPED) {
        Some(hook) => hook(error),
        None => tracing::warn!(
            error = %error,
            label = error.as_label(),
            "error dropped after termination"
        ),
    }
}

pub(crate) fn unhandled_error(error: &FluxError) {
    tracing::error!(
        error = %error,
        label = error.as_label(),
        "unhandled error (no error callback)"
    );
    let hook = unhandled_slot().read().clone();
    if let Some(hook) = hook {
        hook(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_context_hooks_receive_drops() {
        let items = Arc::new(Mutex::new(Vec::<i32>::new()));
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let (i, e) = (items.clone(), errors.clone());
        let cx = with_dropped_hooks(
            &Context::empty(),
            move |item| {
                if let Ok(v) = item.downcast::<i32>() {
                    i.lock().push(*v);
                }
            },
            move |err| e.lock().push(err.to_string()),
        );
        on_next_dropped(7_i32, &cx);
        on_error_dropped(FluxError::msg("late"), &cx);
        assert_eq!(*items.lock(), vec![7]);
        assert_eq!(*errors.lock(), vec!["late".to_string()]);
    }
}
