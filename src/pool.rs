//! Connection pool
//!
//! Sessions are keyed by host address and live until they are closed
//! explicitly. The pool is created at the start of a run, handed by reference
//! to every service, and drained with [`ConnectionPool::close_all`] at the end.

use crate::error::{Result, SetupError};
use crate::utils::exec::{CommandExecutor, Connector, Credentials};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Per-address slot. Its own lock serializes connecting to that address
/// without holding the map lock, so a slow host never blocks the others.
/// Slots are removed from the map before they are closed.
struct Slot<S> {
    session: Mutex<Option<Arc<S>>>,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    slots: Mutex<HashMap<String, Arc<Slot<C::Session>>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot<C::Session>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the session for `address`, opening it on first use
    ///
    /// The first call for an address must carry credentials; later calls may
    /// omit them and receive the same session.
    pub fn get(&self, address: &str, credentials: Option<&Credentials>) -> Result<Arc<C::Session>> {
        loop {
            let slot = {
                let mut slots = self.slots();
                match slots.get(address) {
                    Some(slot) => Arc::clone(slot),
                    None => {
                        if credentials.is_none() {
                            return Err(SetupError::configuration(format!(
                                "no session for {} and no credentials to open one",
                                address
                            )));
                        }
                        let slot = Arc::new(Slot {
                            session: Mutex::new(None),
                        });
                        slots.insert(address.to_string(), Arc::clone(&slot));
                        slot
                    }
                }
            };

            // Lock order is slot, then map. Never the reverse.
            let mut session = slot.session.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_current(address, &slot) {
                // Closed while we waited for the slot
                continue;
            }
            if let Some(existing) = session.as_ref() {
                return Ok(Arc::clone(existing));
            }

            let Some(credentials) = credentials else {
                return Err(SetupError::configuration(format!(
                    "session to {} was never opened and no credentials were given",
                    address
                )));
            };

            debug!(address, user = %credentials.user, "opening session");
            return match self.connector.connect(address, credentials) {
                Ok(opened) => {
                    let opened = Arc::new(opened);
                    *session = Some(Arc::clone(&opened));
                    Ok(opened)
                }
                Err(e) => {
                    // Still holding the empty slot, so nobody filled it meanwhile
                    self.remove_if_current(address, &slot);
                    Err(e)
                }
            };
        }
    }

    fn is_current(&self, address: &str, slot: &Arc<Slot<C::Session>>) -> bool {
        self.slots()
            .get(address)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn remove_if_current(&self, address: &str, slot: &Arc<Slot<C::Session>>) {
        let mut slots = self.slots();
        if slots.get(address).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(address);
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.slots().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Close and forget only the named sessions
    pub fn close_selected<S: AsRef<str>>(&self, addresses: &[S]) {
        let removed: Vec<(String, Arc<Slot<C::Session>>)> = {
            let mut slots = self.slots();
            addresses
                .iter()
                .filter_map(|a| {
                    let address = a.as_ref();
                    slots.remove(address).map(|slot| (address.to_string(), slot))
                })
                .collect()
        };
        for (address, slot) in removed {
            close_slot(&address, &slot);
        }
    }

    /// Close and forget every session
    pub fn close_all(&self) {
        let removed: Vec<(String, Arc<Slot<C::Session>>)> = self.slots().drain().collect();
        for (address, slot) in removed {
            close_slot(&address, &slot);
        }
    }
}

fn close_slot<S: CommandExecutor>(address: &str, slot: &Slot<S>) {
    let taken = slot
        .session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(session) = taken {
        debug!(address, "closing session");
        if let Err(e) = session.close() {
            warn!(address, error = %e, "failed to close session");
        }
    }
}
