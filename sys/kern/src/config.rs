// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run-time kernel policy knobs.

use serde::Deserialize;

/// Policy settings fixed when the kernel is constructed.
///
/// The generated `KERNEL_CONFIG` is built from the `config` section of the
/// kernel configuration document; every field is optional there and falls back
/// to [`KernelConfig::DEFAULT`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// A boundary violation by any thread halts the whole system, instead of
    /// terminating only the offending thread.
    pub fatal_on_any_fault: bool,
    /// Fault reports name the specific denial and the address involved. When
    /// clear, only a generic line is logged, so the log can't be used to search
    /// for objects a thread isn't allowed to see.
    pub verbose_faults: bool,
    /// Whether `ObjectAlloc` is available.
    pub dynamic_objects: bool,
    /// Capacity of a thread name, including its terminating NUL.
    pub max_name_len: usize,
    /// Upper bound on the number of dynamically allocated objects registered
    /// at any one time.
    pub max_dynamic_objects: usize,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        fatal_on_any_fault: false,
        verbose_faults: cfg!(debug_assertions),
        dynamic_objects: true,
        max_name_len: 32,
        max_dynamic_objects: 256,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
