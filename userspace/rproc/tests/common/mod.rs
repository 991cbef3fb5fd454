// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared host fixtures for the rproc integration tests.

#![allow(dead_code)]

use nexus_rproc::host::HostRig;
use nexus_rproc::{Rproc, RprocConfig};
use nexus_shm::PAGE_SIZE;

/// Small pool, short timeout, 16-page region.
pub fn config() -> RprocConfig {
    RprocConfig {
        timeout_ms: 200,
        poll_interval_us: 500,
        shm_size: Some(16 * PAGE_SIZE),
        channels: 4,
        ..RprocConfig::default()
    }
}

/// Starts a subsystem against a fresh host rig.
pub fn start(config: RprocConfig) -> (HostRig, Rproc) {
    let rig = HostRig::new(&config);
    let rproc = Rproc::start(config, rig.platform()).expect("rproc starts");
    (rig, rproc)
}
