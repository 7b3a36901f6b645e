//! PDO decode-callback registry.

use std::collections::HashMap;

pub(crate) type PdoHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Maps a COB-ID to a decode callback. The last registration for an id
/// wins; lookup is O(1). Callbacks run on the dispatch task before the
/// frame joins the batch event.
#[derive(Default)]
pub(crate) struct PdoRegistry {
    bindings: HashMap<u16, PdoHandler>,
}

impl PdoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, cob: u16, handler: PdoHandler) {
        self.bindings.insert(cob, handler);
    }

    pub fn unbind(&mut self, cob: u16) {
        self.bindings.remove(&cob);
    }

    /// Invoke the handler bound to `cob`, if any.
    pub fn dispatch(&mut self, cob: u16, payload: &[u8]) -> bool {
        match self.bindings.get_mut(&cob) {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn last_binding_wins() {
        let mut registry = PdoRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        registry.bind(0x181, Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = second.clone();
        registry.bind(0x181, Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.dispatch(0x181, &[0u8; 2]));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbind_removes_handler() {
        let mut registry = PdoRegistry::new();
        registry.bind(0x205, Box::new(|_| {}));
        registry.unbind(0x205);
        assert!(!registry.dispatch(0x205, &[]));
    }
}
