//! Transient whitelist of trusted reply addresses.
//!
//! When the bridge approves a message that expects a reply, the reply leg
//! must come back through without re-matching the permission rules. Each
//! whitelisted address is good for a single use and expires after a
//! timeout if the reply never arrives.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::timer;

/// Default lifetime of a whitelisted reply address.
pub(crate) const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Set of reply addresses accepted without permission checks.
#[derive(Debug)]
pub(crate) struct ReplyRegistry {
    accepted: Mutex<HashSet<String>>,
    timeout: Duration,
}

impl ReplyRegistry {
    pub(crate) fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(HashSet::new()),
            timeout,
        })
    }

    /// Whitelist `address` and arm its expiry timer.
    ///
    /// Duplicate additions collapse into the existing entry. The timer
    /// removal is idempotent, so a timer outliving a consumed entry is
    /// harmless.
    pub(crate) fn add(self: &Arc<Self>, address: &str) {
        self.accepted
            .lock()
            .expect("lock poisoned")
            .insert(address.to_owned());

        let registry = Arc::clone(self);
        let address = address.to_owned();
        timer::schedule(self.timeout, move || {
            if registry
                .accepted
                .lock()
                .expect("lock poisoned")
                .remove(&address)
            {
                log::debug!("reply address {address} expired unused");
            }
        });
    }

    /// Remove `address` from the whitelist, reporting whether it was there.
    pub(crate) fn consume(&self, address: &str) -> bool {
        self.accepted.lock().expect("lock poisoned").remove(address)
    }
}
