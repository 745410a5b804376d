//! Catch handler panics together with the backtrace of the panicking thread.
//!
//! `catch_unwind` returns once the stack has been unwound: the backtrace has to be taken from
//! a panic hook, while the handler frames are still there.
use futures_util::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

thread_local! {
    static POLLING_HANDLER: Cell<bool> = const { Cell::new(false) };
    static HANDLER_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// A panic raised by a handler.
pub(crate) struct CaughtPanic {
    payload: Box<dyn Any + Send>,
    backtrace: Option<Backtrace>,
}

impl CaughtPanic {
    pub(crate) fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message
        } else {
            "Box<dyn Any>"
        }
    }

    pub(crate) fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

/// Run `future` to completion, turning a panic into a [`CaughtPanic`].
pub(crate) async fn catch_panic<F: Future>(future: F) -> Result<F::Output, CaughtPanic> {
    install_hook();
    tokio::pin!(future);
    let traced = futures_util::future::poll_fn(|cx| {
        let _scope = HandlerScope::enter();
        future.as_mut().poll(cx)
    });
    AssertUnwindSafe(traced)
        .catch_unwind()
        .await
        .map_err(|payload| CaughtPanic {
            payload,
            // The hook ran on this thread, in the poll that just unwound.
            backtrace: HANDLER_BACKTRACE.with(|slot| slot.borrow_mut().take()),
        })
}

/// Chain a hook recording the backtrace of panics raised while a handler is polled.
/// Other panics are left to the hooks installed before.
fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let in_handler = POLLING_HANDLER.try_with(Cell::get).unwrap_or(false);
            if in_handler {
                let _ = HANDLER_BACKTRACE
                    .try_with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            }
            previous(info);
        }));
    });
}

/// Flags the current thread as polling a handler until dropped, unwinding included.
struct HandlerScope {
    previous: bool,
}

impl HandlerScope {
    fn enter() -> Self {
        Self {
            previous: POLLING_HANDLER.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        let _ = POLLING_HANDLER.try_with(|flag| flag.set(self.previous));
    }
}
