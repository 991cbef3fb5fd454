// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Optional process-wide subsystem instance
//! OWNERS: @runtime
//!
//! Drivers that cannot thread an [`Rproc`] through their call graph install one
//! instance here at boot and look it up with [`current`].

use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::Rproc;

static INSTANCE: RwLock<Option<Arc<Rproc>>> = parking_lot::const_rwlock(None);

/// Installs `rproc` as the process-wide instance.
///
/// Fails, handing `rproc` back, if an instance is already installed.
pub fn install(rproc: Rproc) -> Result<Arc<Rproc>, Rproc> {
    let mut slot = INSTANCE.write();
    if slot.is_some() {
        warn!("rproc: global instance already installed");
        return Err(rproc);
    }
    let rproc = Arc::new(rproc);
    *slot = Some(Arc::clone(&rproc));
    Ok(rproc)
}

/// The installed instance, if any.
pub fn current() -> Option<Arc<Rproc>> {
    INSTANCE.read().clone()
}

/// Shuts down and removes the installed instance. Returns `false` if none was installed.
pub fn shutdown() -> bool {
    let Some(rproc) = INSTANCE.write().take() else {
        return false;
    };
    rproc.shutdown();
    info!("rproc: global instance removed");
    true
}
