use std::sync::Arc;

use parking_lot::Mutex;

use crate::listener::GenericListener;

/// Receives a callback whenever a listener's reachable addresses change.
///
/// Handlers are invoked without any listener lock held and may query the
/// listener (for example [`GenericListener::wan_addresses`]).
pub trait AddressesChangedHandler: Send + Sync {
    fn on_addresses_changed(&self, listener: &dyn GenericListener);
}

impl<F> AddressesChangedHandler for F
where
    F: Fn(&dyn GenericListener) + Send + Sync,
{
    fn on_addresses_changed(&self, listener: &dyn GenericListener) {
        self(listener)
    }
}

#[derive(Default)]
pub struct AddressesChangedNotifier {
    handlers: Mutex<Vec<Arc<dyn AddressesChangedHandler>>>,
}

impl AddressesChangedNotifier {
    pub fn register(&self, handler: Arc<dyn AddressesChangedHandler>) {
        self.handlers.lock().push(handler);
    }
    pub fn notify(&self, listener: &dyn GenericListener) {
        // Handlers may register further handlers.
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler.on_addresses_changed(listener);
        }
    }}
