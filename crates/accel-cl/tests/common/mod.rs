#![allow(dead_code)]

use std::sync::Arc;

use accel_cl::{get_platforms, Backend, CommandQueue, Context, Device, Platform, QueueOptions};
use accel_soft::{SoftConfig, SoftRuntime};

pub struct Rig {
    pub runtime: Arc<SoftRuntime>,
    pub platform: Platform,
    pub devices: Vec<Device>,
    pub context: Context,
    pub queue: CommandQueue,
}

pub fn rig() -> Rig {
    rig_with(SoftConfig::default(), QueueOptions::default())
}

pub fn rig_with(config: SoftConfig, options: QueueOptions) -> Rig {
    let runtime = SoftRuntime::new(config).unwrap();
    let backend: Arc<dyn Backend> = runtime.clone();
    let platform = get_platforms(&backend).unwrap().remove(0);
    let devices = platform.get_devices().unwrap();
    let context = Context::new(&platform, &devices).unwrap();
    let queue = CommandQueue::new(&context, &devices[0], options).unwrap();
    Rig {
        runtime,
        platform,
        devices,
        context,
        queue,
    }
}

impl Rig {
    /// Drops every wrapper object and returns the runtime for ledger checks.
    pub fn teardown(self) -> Arc<SoftRuntime> {
        let Rig { runtime, .. } = self;
        runtime
    }
}

pub fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_of_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}
