//! Loader layer-chain structures and next-layer dispatch tables.
//!
//! A Vulkan layer receives the rest of the chain through `VkLayerInstanceCreateInfo`
//! / `VkLayerDeviceCreateInfo` records threaded into the create-info `pNext`
//! chain. Those records live in `vk_layer.h`, which `ash` does not bind, so
//! they are declared here by hand. Dispatch tables are plain structs of
//! function pointers resolved once at create time; hot paths copy them out
//! under the global lock and call through them unlocked.

use std::collections::HashMap;
use std::ffi::c_void;

use ash::vk;

use crate::fence_wait::FenceWaitThread;

/// `VkLayerFunction` value selecting the layer link info record.
pub const VK_LAYER_LINK_INFO: i32 = 0;

/// One link of the instance-layer chain (`VkLayerInstanceLink`).
#[repr(C)]
pub struct VkLayerInstanceLink {
    pub p_next: *mut VkLayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    /// `PFN_GetPhysicalDeviceProcAddr`; unused by this layer.
    pub pfn_next_get_physical_device_proc_addr: *const c_void,
}

/// Loader-injected record in the instance create-info chain
/// (`VkLayerInstanceCreateInfo`).
#[repr(C)]
pub struct VkLayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    /// The `pLayerInfo` arm of the union; the other arms are loader-data
    /// callbacks this layer never selects.
    pub layer_info: *mut VkLayerInstanceLink,
}

/// One link of the device-layer chain (`VkLayerDeviceLink`).
#[repr(C)]
pub struct VkLayerDeviceLink {
    pub p_next: *mut VkLayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

/// Loader-injected record in the device create-info chain
/// (`VkLayerDeviceCreateInfo`).
#[repr(C)]
pub struct VkLayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub layer_info: *mut VkLayerDeviceLink,
}

/// Walk an instance create-info `pNext` chain to the loader's layer link
/// record, or null if absent.
///
/// # Safety
/// `p_next` must point to a well-formed Vulkan structure chain.
pub unsafe fn find_instance_layer_info(p_next: *const c_void) -> *mut VkLayerInstanceCreateInfo {
    let mut cursor = p_next as *mut VkLayerInstanceCreateInfo;
    while !cursor.is_null()
        && ((*cursor).s_type != vk::StructureType::LOADER_INSTANCE_CREATE_INFO
            || (*cursor).function != VK_LAYER_LINK_INFO)
    {
        cursor = (*cursor).p_next as *mut VkLayerInstanceCreateInfo;
    }
    cursor
}

/// Walk a device create-info `pNext` chain to the loader's layer link
/// record, or null if absent.
///
/// # Safety
/// `p_next` must point to a well-formed Vulkan structure chain.
pub unsafe fn find_device_layer_info(p_next: *const c_void) -> *mut VkLayerDeviceCreateInfo {
    let mut cursor = p_next as *mut VkLayerDeviceCreateInfo;
    while !cursor.is_null()
        && ((*cursor).s_type != vk::StructureType::LOADER_DEVICE_CREATE_INFO
            || (*cursor).function != VK_LAYER_LINK_INFO)
    {
        cursor = (*cursor).p_next as *mut VkLayerDeviceCreateInfo;
    }
    cursor
}

/// Next-layer instance functions this layer calls.
#[derive(Clone, Copy)]
pub struct InstanceDispatch {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub destroy_instance: Option<vk::PFN_vkDestroyInstance>,
    pub enumerate_device_extension_properties: Option<vk::PFN_vkEnumerateDeviceExtensionProperties>,
}

/// Next-layer device functions this layer calls.
#[derive(Clone, Copy)]
pub struct DeviceDispatch {
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub destroy_device: Option<vk::PFN_vkDestroyDevice>,
    pub queue_present_khr: Option<vk::PFN_vkQueuePresentKHR>,
    pub acquire_next_image_khr: Option<vk::PFN_vkAcquireNextImageKHR>,
    pub acquire_next_image2_khr: Option<vk::PFN_vkAcquireNextImage2KHR>,
    pub create_fence: Option<vk::PFN_vkCreateFence>,
    pub destroy_fence: Option<vk::PFN_vkDestroyFence>,
    pub queue_submit: Option<vk::PFN_vkQueueSubmit>,
    pub wait_for_fences: Option<vk::PFN_vkWaitForFences>,
}

// SAFETY: dispatch tables are plain function pointers.
unsafe impl Send for InstanceDispatch {}
unsafe impl Send for DeviceDispatch {}

/// Layer bookkeeping, keyed by dispatch key. Mutated only at instance and
/// device create/destroy; one lock for simplicity, as in the hot paths only
/// a copy of the (Copy) dispatch table is taken out.
#[derive(Default)]
pub struct LayerState {
    pub instance_dispatch: HashMap<usize, InstanceDispatch>,
    pub device_dispatch: HashMap<usize, DeviceDispatch>,
    /// Device handle per dispatch key; queues share their device's key.
    pub devices: HashMap<usize, vk::Device>,
    pub wait_threads: HashMap<usize, FenceWaitThread>,
}

/// Key for dispatch map lookups: the loader writes a dispatch-table pointer
/// into the first word of every dispatchable handle, shared between a
/// device and its queues.
///
/// # Safety
/// `raw` must be a live dispatchable Vulkan handle.
pub unsafe fn dispatch_key(raw: u64) -> usize {
    *(raw as usize as *const usize)
}
