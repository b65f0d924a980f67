//! Per-device worker that waits on frame completion fences.
//!
//! The present intercept attaches a fence to each frame's final queue
//! submission and hands it here. The worker blocks on each fence in FIFO
//! order, stamps the CPU clock at completion, destroys the fence and feeds
//! the end-of-frame event back to the ticker. Keeping the wait off the
//! application's threads is what lets the present call return immediately.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ash::vk;
use crossbeam::channel::{unbounded, Sender};
use tracing::warn;

use lfx_core::current_time_ns;

use crate::ticker::FrameTicker;

/// Device functions the worker needs, resolved at device creation.
#[derive(Clone, Copy)]
pub struct FenceFns {
    pub wait_for_fences: vk::PFN_vkWaitForFences,
    pub destroy_fence: vk::PFN_vkDestroyFence,
}

// SAFETY: plain function pointers.
unsafe impl Send for FenceFns {}

struct PendingFrame {
    fence: vk::Fence,
    frame_id: u64,
}

/// Device handle moved onto the worker thread. Dispatchable handles are raw
/// pointers and not `Send` on their own.
struct DeviceHandle(vk::Device);

// SAFETY: the handle is only passed to Vulkan entry points for fence waits,
// which are externally synchronized by this worker being their sole caller.
unsafe impl Send for DeviceHandle {}

/// Owns the fence wait worker for one logical device.
///
/// Dropping the handle closes the queue; the worker drains every queued
/// fence (waiting on and destroying each) and is joined. Drop this before
/// tearing down the device so no fence outlives it.
pub struct FenceWaitThread {
    sender: Option<Sender<PendingFrame>>,
    thread: Option<JoinHandle<()>>,
}

impl FenceWaitThread {
    pub fn spawn(device: vk::Device, fns: FenceFns, ticker: Arc<FrameTicker>) -> Self {
        let (sender, receiver) = unbounded::<PendingFrame>();
        let device = DeviceHandle(device);

        let thread = thread::Builder::new()
            .name("lfx-fence-wait".into())
            .spawn(move || {
                let device = device;
                while let Ok(pending) = receiver.recv() {
                    // SAFETY: the fence was created against this device and
                    // ownership moved to this thread with the message.
                    unsafe {
                        (fns.wait_for_fences)(device.0, 1, &pending.fence, vk::TRUE, u64::MAX);
                    }
                    let timestamp = current_time_ns();
                    unsafe {
                        (fns.destroy_fence)(device.0, pending.fence, std::ptr::null());
                    }
                    ticker.complete_frame(pending.frame_id, timestamp);
                }
            })
            .expect("failed to spawn fence wait thread");

        Self {
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    /// Queue a frame's completion fence. The worker takes ownership of the
    /// fence and destroys it after it signals.
    pub fn push(&self, fence: vk::Fence, frame_id: u64) {
        if let Some(sender) = &self.sender {
            if sender.send(PendingFrame { fence, frame_id }).is_err() {
                warn!(frame_id, "fence wait thread is gone; dropping completion");
            }
        }
    }
}

impl Drop for FenceWaitThread {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the remaining fences
        // and exit.
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
