// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

/// Thread table size when `KERN_MAX_THREADS` isn't set.
const DEFAULT_MAX_THREADS: usize = 64;
/// Trace ring depth when `KERN_TRACE_DEPTH` isn't set.
const DEFAULT_TRACE_DEPTH: usize = 32;

// Must agree with `RegionAttributes` in src/descs.rs.
const ATTR_READ: u32 = 1 << 0;
const ATTR_WRITE: u32 = 1 << 1;
const ATTR_EXECUTE: u32 = 1 << 2;
const ATTR_DEVICE: u32 = 1 << 3;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR not set")?);

    generate_consts(&out)?;
    generate_statics(&out)?;

    Ok(())
}

fn env_usize(name: &str, default: usize) -> Result<usize, Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed={name}");
    match env::var(name) {
        Ok(v) => Ok(v.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e.into()),
    }
}

fn generate_consts(out: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let max_threads = env_usize("KERN_MAX_THREADS", DEFAULT_MAX_THREADS)?;
    if !(1..=1024).contains(&max_threads) {
        return Err(format!(
            "KERN_MAX_THREADS must be between 1 and 1024, not {max_threads}"
        )
        .into());
    }
    let trace_depth = env_usize("KERN_TRACE_DEPTH", DEFAULT_TRACE_DEPTH)?;

    let mut const_file = File::create(out.join("consts.rs"))?;
    writeln!(const_file, "// See build.rs for details")?;
    writeln!(const_file, "/// Number of thread slots.")?;
    writeln!(const_file, "pub const MAX_THREADS: usize = {max_threads};")?;
    writeln!(const_file, "/// Entries kept in the kernel trace ring.")?;
    writeln!(const_file, "pub const TRACE_DEPTH: usize = {trace_depth};")?;
    Ok(())
}

fn generate_statics(out: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_KCONFIG");
    let kconfig: KernelConfig = match env::var("KERN_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };

    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;

    writeln!(
        file,
        "pub static KERNEL_OBJECT_DESCS: [abi::ObjectDesc; {}] = [",
        kconfig.objects.len()
    )?;
    for obj in &kconfig.objects {
        writeln!(file, "    abi::ObjectDesc {{")?;
        writeln!(file, "        address: {:#x},", obj.address)?;
        writeln!(file, "        kind: abi::ObjectKind::{:?},", obj.kind)?;
        writeln!(file, "        size: {:#x},", obj.size)?;
        writeln!(file, "        public: {},", obj.public)?;
        writeln!(file, "        initialized: {},", obj.initialized)?;
        writeln!(file, "    }},")?;
    }
    writeln!(file, "];")?;

    for (i, thread) in kconfig.threads.iter().enumerate() {
        writeln!(
            file,
            "static KERNEL_THREAD_{i}_REGIONS: [crate::descs::RegionDesc; {}] = [",
            thread.regions.len()
        )?;
        for region in &thread.regions {
            writeln!(file, "    crate::descs::RegionDesc {{")?;
            writeln!(file, "        base: {:#x},", region.base)?;
            writeln!(file, "        size: {:#x},", region.size)?;
            writeln!(
                file,
                "        attributes: \
                crate::descs::RegionAttributes::from_bits_truncate({:#x}),",
                region.attribute_bits()
            )?;
            writeln!(file, "    }},")?;
        }
        writeln!(file, "];")?;
    }

    writeln!(
        file,
        "pub static KERNEL_THREAD_DESCS: \
        [crate::descs::ThreadDesc<'static>; {}] = [",
        kconfig.threads.len()
    )?;
    for (i, thread) in kconfig.threads.iter().enumerate() {
        writeln!(file, "    crate::descs::ThreadDesc {{")?;
        writeln!(file, "        object: {:#x},", thread.object)?;
        writeln!(file, "        regions: &KERNEL_THREAD_{i}_REGIONS,")?;
        writeln!(file, "        pool_size: {},", thread.pool_size)?;
        writeln!(file, "    }},")?;
    }
    writeln!(file, "];")?;

    let policy = &kconfig.config;
    writeln!(
        file,
        "pub const KERNEL_CONFIG: crate::config::KernelConfig = \
        crate::config::KernelConfig {{"
    )?;
    writeln!(
        file,
        "    fatal_on_any_fault: {},",
        policy.fatal_on_any_fault
    )?;
    match policy.verbose_faults {
        Some(v) => writeln!(file, "    verbose_faults: {v},")?,
        None => writeln!(file, "    verbose_faults: cfg!(debug_assertions),")?,
    }
    writeln!(file, "    dynamic_objects: {},", policy.dynamic_objects)?;
    writeln!(file, "    max_name_len: {},", policy.max_name_len)?;
    writeln!(
        file,
        "    max_dynamic_objects: {},",
        policy.max_dynamic_objects
    )?;
    writeln!(file, "}};")?;

    Ok(())
}

/// The kernel configuration document, as found in `KERN_KCONFIG`.
#[derive(Default, Deserialize)]
#[serde(default)]
struct KernelConfig {
    objects: Vec<abi::ObjectDesc>,
    threads: Vec<ThreadConfig>,
    config: PolicyConfig,
}

#[derive(Deserialize)]
struct ThreadConfig {
    /// Address of the thread's `Thread` object.
    object: usize,
    #[serde(default)]
    pool_size: usize,
    #[serde(default)]
    regions: Vec<RegionConfig>,
}

#[derive(Deserialize)]
struct RegionConfig {
    base: usize,
    size: usize,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
    #[serde(default)]
    execute: bool,
    #[serde(default)]
    device: bool,
}

impl RegionConfig {
    fn attribute_bits(&self) -> u32 {
        [
            (self.read, ATTR_READ),
            (self.write, ATTR_WRITE),
            (self.execute, ATTR_EXECUTE),
            (self.device, ATTR_DEVICE),
        ]
        .into_iter()
        .filter(|&(set, _)| set)
        .fold(0, |bits, (_, bit)| bits | bit)
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct PolicyConfig {
    fatal_on_any_fault: bool,
    /// Left unset, this follows `debug_assertions` in the kernel build.
    verbose_faults: Option<bool>,
    dynamic_objects: bool,
    max_name_len: usize,
    max_dynamic_objects: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fatal_on_any_fault: false,
            verbose_faults: None,
            dynamic_objects: true,
            max_name_len: 32,
            max_dynamic_objects: 256,
        }
    }
}
