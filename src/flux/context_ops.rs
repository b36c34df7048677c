//! # Context writes and reads.
//!
//! Writes travel towards the source at subscribe time; reads resolve against
//! the context their subscription received. A write is therefore visible to
//! every operator upstream of it and to none downstream.

use std::any::Any;
use std::sync::Arc;

use super::{Flux, Item};
use crate::context::Context;

impl<T: Item> Flux<T> {
    /// Binds `key` to `value` for everything upstream of this point.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let flux = Flux::deferred_contextual(|cx| Flux::just(cx.get_or("user", "anonymous")))
    ///     .context_write("user", "ana");
    /// assert_eq!(flux.block_first(None).unwrap(), Some("ana"));
    /// ```
    pub fn context_write<V>(self, key: impl Into<Arc<str>>, value: V) -> Flux<T>
    where
        V: Any + Clone + Send + Sync,
    {
        let key: Arc<str> = key.into();
        Flux::from_fn(move |sub, cx: Context| {
            self.subscribe_inner(sub, cx.put(Arc::clone(&key), value.clone()));
        })
    }

    /// Layers the entries returned by `f` on top of the incoming context.
    pub fn context_write_with<F>(self, f: F) -> Flux<T>
    where
        F: Fn(&Context) -> Context + Send + Sync + 'static,
    {
        Flux::from_fn(move |sub, cx: Context| {
            let written = f(&cx);
            self.subscribe_inner(sub, cx.put_all(&written));
        })
    }

    /// Builds the flux per subscription from the subscriber's context.
    pub fn deferred_contextual<F>(supplier: F) -> Flux<T>
    where
        F: Fn(&Context) -> Flux<T> + Send + Sync + 'static,
    {
        Flux::from_fn(move |sub, cx: Context| {
            supplier(&cx).subscribe_inner(sub, cx);
        })
    }

    /// Rewrites this flux per subscription with access to its context.
    pub fn transform_deferred_contextual<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(Flux<T>, &Context) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_fn(move |sub, cx: Context| {
            f(self.clone(), &cx).subscribe_inner(sub, cx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;

    fn read(label: &'static str) -> Flux<(&'static str, i32)> {
        Flux::deferred_contextual(move |cx| Flux::just((label, cx.get_or("K", -1))))
    }

    #[test]
    fn test_innermost_write_shadows() {
        let flux = read("up")
            .context_write("K", 10)
            .concat_with(read("between"))
            .context_write("K", 100);
        StepVerifier::create(flux)
            .expect_next(("up", 10))
            .expect_next(("between", 100))
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_write_does_not_leak_downstream() {
        let flux = read("outer").flat_map(|_| read("inner").context_write("K", 7));
        StepVerifier::create(flux)
            .expect_next(("inner", 7))
            .verify_complete()
            .unwrap();

        let flux = Flux::just(1).flat_map(|_| read("inner").context_write("K", 7)).concat_with(read("after"));
        StepVerifier::create(flux.map(|(_, v)| v))
            .expect_next_sequence([7, -1])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_write_with_sees_incoming_context() {
        let flux = read("up")
            .context_write_with(|cx| Context::of("K", cx.get_or("K", 0) * 2))
            .context_write("K", 21);
        StepVerifier::create(flux).expect_next(("up", 42)).verify_complete().unwrap();
    }

    #[test]
    fn test_transform_deferred_contextual() {
        let flux = Flux::range(1, 3)
            .transform_deferred_contextual(|f, cx| {
                let factor = cx.get_or("factor", 1_i64);
                f.map(move |v| v * factor)
            })
            .context_write("factor", 10_i64);
        StepVerifier::create(flux)
            .expect_next_sequence([10, 20, 30])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_concurrent_subscriptions_are_isolated() {
        let base = read("r");
        let a = base.clone().context_write("K", 1);
        let b = base.context_write("K", 2);
        StepVerifier::create(a).expect_next(("r", 1)).verify_complete().unwrap();
        StepVerifier::create(b).expect_next(("r", 2)).verify_complete().unwrap();
    }
}
