use crate::error::DropReason;
use arc_swap::ArcSwapOption;
use bytes::Bytes;

/// Outcome callback over `(payload, queue)`.
pub type PayloadHook = Box<dyn Fn(&Bytes, &str) + Send + Sync>;
/// Callback over `(payload, queue, transport error)`.
pub type ErrorHook = Box<dyn Fn(&Bytes, &str, &anyhow::Error) + Send + Sync>;
/// Callback over `(payload, queue, reason)` for discarded payloads.
pub type DropHook = Box<dyn Fn(&Bytes, &str, DropReason) + Send + Sync>;

/// Outcome fan-out cells.
///
/// Each cell is an atomically swappable immutable function reference:
/// written by the user before the first publish (or swapped whole), read
/// on the hot path without a lock.
#[derive(Default)]
pub(crate) struct ProducerHooks {
    confirm: ArcSwapOption<PayloadHook>,
    nack: ArcSwapOption<PayloadHook>,
    error: ArcSwapOption<ErrorHook>,
    drop: ArcSwapOption<DropHook>,
}

impl ProducerHooks {
    pub fn set_confirm(&self, hook: PayloadHook) {
        self.confirm.store(Some(std::sync::Arc::new(hook)));
    }

    pub fn set_nack(&self, hook: PayloadHook) {
        self.nack.store(Some(std::sync::Arc::new(hook)));
    }

    pub fn set_error(&self, hook: ErrorHook) {
        self.error.store(Some(std::sync::Arc::new(hook)));
    }

    pub fn set_drop(&self, hook: DropHook) {
        self.drop.store(Some(std::sync::Arc::new(hook)));
    }

    #[inline]
    pub fn confirmed(&self, payload: &Bytes, queue: &str) {
        if let Some(hook) = self.confirm.load().as_ref() {
            (**hook)(payload, queue);
        }
    }

    #[inline]
    pub fn nacked(&self, payload: &Bytes, queue: &str) {
        if let Some(hook) = self.nack.load().as_ref() {
            (**hook)(payload, queue);
        }
    }

    #[inline]
    pub fn errored(&self, payload: &Bytes, queue: &str, err: &anyhow::Error) {
        if let Some(hook) = self.error.load().as_ref() {
            (**hook)(payload, queue, err);
        }
    }

    #[inline]
    pub fn dropped(&self, payload: &Bytes, queue: &str, reason: DropReason) {
        if let Some(hook) = self.drop.load().as_ref() {
            (**hook)(payload, queue, reason);
        }
    }
}
