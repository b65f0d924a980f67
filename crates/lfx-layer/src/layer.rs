//! Vulkan layer entry points.
//!
//! Implements the loader's explicit-layer contract: chain-advancing
//! instance/device creation, interception of `vkQueuePresentKHR` and the
//! swapchain acquire calls, layer enumeration, and `GetProcAddr` routing.
//! Every intercepted call returns the downstream result unchanged; the layer
//! never fails the host call on its own behalf.

#![allow(non_snake_case)]

use std::ffi::CStr;
use std::mem;
use std::os::raw::c_char;
use std::ptr;

use ash::vk::{self, Handle};
use tracing::{error, warn};

use crate::dispatch::{
    dispatch_key, find_device_layer_info, find_instance_layer_info, DeviceDispatch,
    InstanceDispatch,
};
use crate::fence_wait::{FenceFns, FenceWaitThread};
use crate::overlay::OverlaySink;
use crate::runtime;

pub const LAYER_NAME: &CStr = c"VK_LAYER_LFX_LatencyFleX";
pub const LAYER_DESCRIPTION: &CStr = c"LatencyFleX (TM) latency reduction middleware";

unsafe fn resolve_instance_fn(
    gpa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
    name: &CStr,
) -> vk::PFN_vkVoidFunction {
    gpa(instance, name.as_ptr())
}

unsafe fn resolve_device_fn(
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    device: vk::Device,
    name: &CStr,
) -> vk::PFN_vkVoidFunction {
    gdpa(device, name.as_ptr())
}

///////////////////////////////////////////////////////////////////////////////
// Layer init and shutdown

/// # Safety
/// Called by the Vulkan loader with a valid create-info chain.
pub unsafe extern "system" fn lfx_CreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    let layer_info = find_instance_layer_info((*p_create_info).p_next);
    if layer_info.is_null() || (*layer_info).layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let link = (*layer_info).layer_info;
    let gpa = (*link).pfn_next_get_instance_proc_addr;
    // Advance the chain for the next layer.
    (*layer_info).layer_info = (*link).p_next;

    let create_instance: vk::PFN_vkCreateInstance =
        match resolve_instance_fn(gpa, vk::Instance::null(), c"vkCreateInstance") {
            Some(f) => mem::transmute(f),
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

    let ret = create_instance(p_create_info, p_allocator, p_instance);
    if ret != vk::Result::SUCCESS {
        return ret;
    }
    let instance = *p_instance;

    let dispatch = InstanceDispatch {
        get_instance_proc_addr: match resolve_instance_fn(gpa, instance, c"vkGetInstanceProcAddr")
        {
            Some(f) => mem::transmute(f),
            None => gpa,
        },
        destroy_instance: mem::transmute(resolve_instance_fn(gpa, instance, c"vkDestroyInstance")),
        enumerate_device_extension_properties: mem::transmute(resolve_instance_fn(
            gpa,
            instance,
            c"vkEnumerateDeviceExtensionProperties",
        )),
    };

    let rt = runtime();
    rt.layer_state
        .lock()
        .instance_dispatch
        .insert(dispatch_key(instance.as_raw()), dispatch);

    // The overlay, if any, has been loaded by the time instances are
    // created.
    if let Some(sink) = OverlaySink::resolve() {
        rt.ticker.install_overlay(sink);
    }

    vk::Result::SUCCESS
}

/// # Safety
/// Called by the Vulkan loader with a live instance.
pub unsafe extern "system" fn lfx_DestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let key = dispatch_key(instance.as_raw());
    let dispatch = runtime().layer_state.lock().instance_dispatch.remove(&key);
    if let Some(destroy) = dispatch.and_then(|d| d.destroy_instance) {
        destroy(instance, p_allocator);
    }
}

/// # Safety
/// Called by the Vulkan loader with a valid create-info chain.
pub unsafe extern "system" fn lfx_CreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    let layer_info = find_device_layer_info((*p_create_info).p_next);
    if layer_info.is_null() || (*layer_info).layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let link = (*layer_info).layer_info;
    let gipa = (*link).pfn_next_get_instance_proc_addr;
    let gdpa = (*link).pfn_next_get_device_proc_addr;
    // Advance the chain for the next layer.
    (*layer_info).layer_info = (*link).p_next;

    let create_device: vk::PFN_vkCreateDevice =
        match resolve_instance_fn(gipa, vk::Instance::null(), c"vkCreateDevice") {
            Some(f) => mem::transmute(f),
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

    let ret = create_device(physical_device, p_create_info, p_allocator, p_device);
    if ret != vk::Result::SUCCESS {
        return ret;
    }
    let device = *p_device;

    let dispatch = DeviceDispatch {
        get_device_proc_addr: match resolve_device_fn(gdpa, device, c"vkGetDeviceProcAddr") {
            Some(f) => mem::transmute(f),
            None => gdpa,
        },
        destroy_device: mem::transmute(resolve_device_fn(gdpa, device, c"vkDestroyDevice")),
        queue_present_khr: mem::transmute(resolve_device_fn(gdpa, device, c"vkQueuePresentKHR")),
        acquire_next_image_khr: mem::transmute(resolve_device_fn(
            gdpa,
            device,
            c"vkAcquireNextImageKHR",
        )),
        acquire_next_image2_khr: mem::transmute(resolve_device_fn(
            gdpa,
            device,
            c"vkAcquireNextImage2KHR",
        )),
        create_fence: mem::transmute(resolve_device_fn(gdpa, device, c"vkCreateFence")),
        destroy_fence: mem::transmute(resolve_device_fn(gdpa, device, c"vkDestroyFence")),
        queue_submit: mem::transmute(resolve_device_fn(gdpa, device, c"vkQueueSubmit")),
        wait_for_fences: mem::transmute(resolve_device_fn(gdpa, device, c"vkWaitForFences")),
    };

    let rt = runtime();
    let key = dispatch_key(device.as_raw());
    let mut state = rt.layer_state.lock();
    state.device_dispatch.insert(key, dispatch);
    state.devices.insert(key, device);
    match (dispatch.wait_for_fences, dispatch.destroy_fence) {
        (Some(wait_for_fences), Some(destroy_fence)) => {
            let fns = FenceFns {
                wait_for_fences,
                destroy_fence,
            };
            state
                .wait_threads
                .insert(key, FenceWaitThread::spawn(device, fns, rt.ticker.clone()));
        }
        _ => warn!("fence functions unavailable; frame completion tracking disabled"),
    }

    vk::Result::SUCCESS
}

/// # Safety
/// Called by the Vulkan loader with a live device.
pub unsafe extern "system" fn lfx_DestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let key = dispatch_key(device.as_raw());
    let rt = runtime();

    // Join the fence worker (draining its queue) before the dispatch entry
    // goes away: queued fences must not outlive the device. The worker only
    // takes the pacer lock, so dropping it outside the layer lock cannot
    // deadlock.
    let worker = rt.layer_state.lock().wait_threads.remove(&key);
    drop(worker);

    let dispatch = {
        let mut state = rt.layer_state.lock();
        state.devices.remove(&key);
        state.device_dispatch.remove(&key)
    };
    if let Some(destroy) = dispatch.and_then(|d| d.destroy_device) {
        destroy(device, p_allocator);
    }
}

///////////////////////////////////////////////////////////////////////////////
// Enumeration

fn write_layer_name(dst: &mut [c_char], src: &CStr) {
    let bytes = src.to_bytes_with_nul();
    for (d, s) in dst.iter_mut().zip(bytes.iter()) {
        *d = *s as c_char;
    }
}

/// # Safety
/// `p_properties`, when non-null, must point to `*p_property_count` entries.
pub unsafe extern "system" fn lfx_EnumerateInstanceLayerProperties(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    if !p_property_count.is_null() {
        *p_property_count = 1;
    }
    if !p_properties.is_null() {
        let props = &mut *p_properties;
        write_layer_name(&mut props.layer_name, LAYER_NAME);
        write_layer_name(&mut props.description, LAYER_DESCRIPTION);
        props.implementation_version = 1;
        props.spec_version = vk::make_api_version(0, 1, 2, 136);
    }
    vk::Result::SUCCESS
}

/// # Safety
/// Same contract as [`lfx_EnumerateInstanceLayerProperties`].
pub unsafe extern "system" fn lfx_EnumerateDeviceLayerProperties(
    _physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    lfx_EnumerateInstanceLayerProperties(p_property_count, p_properties)
}

/// # Safety
/// `p_layer_name` must be null or a valid C string.
pub unsafe extern "system" fn lfx_EnumerateInstanceExtensionProperties(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if p_layer_name.is_null() || CStr::from_ptr(p_layer_name) != LAYER_NAME {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    // This layer exposes no extensions.
    if !p_property_count.is_null() {
        *p_property_count = 0;
    }
    vk::Result::SUCCESS
}

/// # Safety
/// Called by the loader with a live physical device (or null).
pub unsafe extern "system" fn lfx_EnumerateDeviceExtensionProperties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    // Pass through any query that isn't about this layer.
    if p_layer_name.is_null() || CStr::from_ptr(p_layer_name) != LAYER_NAME {
        if physical_device == vk::PhysicalDevice::null() {
            return vk::Result::SUCCESS;
        }
        let key = dispatch_key(physical_device.as_raw());
        let enumerate = runtime()
            .layer_state
            .lock()
            .instance_dispatch
            .get(&key)
            .and_then(|d| d.enumerate_device_extension_properties);
        return match enumerate {
            Some(f) => f(physical_device, p_layer_name, p_property_count, p_properties),
            None => vk::Result::ERROR_INITIALIZATION_FAILED,
        };
    }

    if !p_property_count.is_null() {
        *p_property_count = 0;
    }
    vk::Result::SUCCESS
}

///////////////////////////////////////////////////////////////////////////////
// Frame interception

/// # Safety
/// Called by the application with a queue it owns and a valid present info.
pub unsafe extern "system" fn lfx_QueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let rt = runtime();
    let frame_id = rt.ticker.note_present();

    let key = dispatch_key(queue.as_raw());
    let (device, dispatch) = {
        let state = rt.layer_state.lock();
        match (state.devices.get(&key), state.device_dispatch.get(&key)) {
            (Some(device), Some(dispatch)) => (*device, *dispatch),
            _ => return vk::Result::ERROR_DEVICE_LOST,
        }
    };

    if let Err(err) = submit_completion_fence(rt, key, queue, device, &dispatch, p_present_info, frame_id)
    {
        // Continue without tracking this frame; its slot keeps the previous
        // id, so the eventual end_frame is a no-op.
        error!(frame_id, err, "failed to enqueue completion fence");
    }

    match dispatch.queue_present_khr {
        Some(present) => present(queue, p_present_info),
        None => vk::Result::ERROR_DEVICE_LOST,
    }
}

/// Create a fence and submit a sync-only batch that waits on the present's
/// wait-semaphores, re-signals them (so the present itself still observes
/// them), and signals the fence once all prior rendering work is done.
unsafe fn submit_completion_fence(
    rt: &crate::LfxRuntime,
    key: usize,
    queue: vk::Queue,
    device: vk::Device,
    dispatch: &DeviceDispatch,
    p_present_info: *const vk::PresentInfoKHR<'_>,
    frame_id: u64,
) -> Result<(), &'static str> {
    let create_fence = dispatch.create_fence.ok_or("vkCreateFence not resolved")?;
    let queue_submit = dispatch.queue_submit.ok_or("vkQueueSubmit not resolved")?;

    let fence_info = vk::FenceCreateInfo::default();
    let mut fence = vk::Fence::null();
    let res = create_fence(device, &fence_info, ptr::null(), &mut fence);
    if res != vk::Result::SUCCESS {
        return Err("fence creation failed");
    }

    let present = &*p_present_info;
    let wait_semaphores = if present.wait_semaphore_count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(
            present.p_wait_semaphores,
            present.wait_semaphore_count as usize,
        )
    };
    let wait_stages =
        vec![vk::PipelineStageFlags::ALL_COMMANDS; present.wait_semaphore_count as usize];
    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .signal_semaphores(wait_semaphores);

    let res = queue_submit(queue, 1, &submit_info, fence);
    if res != vk::Result::SUCCESS {
        if let Some(destroy_fence) = dispatch.destroy_fence {
            destroy_fence(device, fence, ptr::null());
        }
        return Err("sync submit failed");
    }

    let state = rt.layer_state.lock();
    match state.wait_threads.get(&key) {
        Some(worker) => {
            worker.push(fence, frame_id);
            Ok(())
        }
        None => {
            drop(state);
            if let Some(destroy_fence) = dispatch.destroy_fence {
                destroy_fence(device, fence, ptr::null());
            }
            Err("no fence wait thread for device")
        }
    }
}

/// # Safety
/// Called by the application per the `vkAcquireNextImageKHR` contract.
pub unsafe extern "system" fn lfx_AcquireNextImageKHR(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let rt = runtime();
    let key = dispatch_key(device.as_raw());
    let acquire = rt
        .layer_state
        .lock()
        .device_dispatch
        .get(&key)
        .and_then(|d| d.acquire_next_image_khr);
    let res = match acquire {
        Some(f) => f(device, swapchain, timeout, semaphore, fence, p_image_index),
        None => return vk::Result::ERROR_DEVICE_LOST,
    };
    if res.as_raw() < 0 {
        // Likely an alt-tab or resize. The application will probably drop
        // this frame without presenting, desyncing the frame counters;
        // schedule a recalibration right away.
        rt.ticker.note_acquire_error();
    }
    res
}

/// # Safety
/// Called by the application per the `vkAcquireNextImage2KHR` contract.
pub unsafe extern "system" fn lfx_AcquireNextImage2KHR(
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR<'_>,
    p_image_index: *mut u32,
) -> vk::Result {
    let rt = runtime();
    let key = dispatch_key(device.as_raw());
    let acquire = rt
        .layer_state
        .lock()
        .device_dispatch
        .get(&key)
        .and_then(|d| d.acquire_next_image2_khr);
    let res = match acquire {
        Some(f) => f(device, p_acquire_info, p_image_index),
        None => return vk::Result::ERROR_DEVICE_LOST,
    };
    if res.as_raw() < 0 {
        rt.ticker.note_acquire_error();
    }
    res
}

///////////////////////////////////////////////////////////////////////////////
// GetProcAddr routing

fn as_void_fn<T>(f: T) -> vk::PFN_vkVoidFunction
where
    T: Copy,
{
    // SAFETY: T is one of the lfx_* function pointer types below; all
    // function pointers share a representation.
    unsafe {
        debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<unsafe extern "system" fn()>());
        Some(mem::transmute_copy(&f))
    }
}

/// Entry point named by the layer manifest for device-chain dispatch.
///
/// # Safety
/// Called by the loader with a valid name pointer.
#[no_mangle]
pub unsafe extern "system" fn lfx_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = CStr::from_ptr(p_name);
    match name.to_bytes() {
        b"vkGetDeviceProcAddr" => {
            return as_void_fn(lfx_GetDeviceProcAddr as vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkEnumerateDeviceLayerProperties" => {
            return as_void_fn(
                lfx_EnumerateDeviceLayerProperties as vk::PFN_vkEnumerateDeviceLayerProperties,
            )
        }
        b"vkEnumerateDeviceExtensionProperties" => {
            return as_void_fn(
                lfx_EnumerateDeviceExtensionProperties
                    as vk::PFN_vkEnumerateDeviceExtensionProperties,
            )
        }
        b"vkCreateDevice" => return as_void_fn(lfx_CreateDevice as vk::PFN_vkCreateDevice),
        b"vkDestroyDevice" => return as_void_fn(lfx_DestroyDevice as vk::PFN_vkDestroyDevice),
        b"vkQueuePresentKHR" => {
            return as_void_fn(lfx_QueuePresentKHR as vk::PFN_vkQueuePresentKHR)
        }
        b"vkAcquireNextImageKHR" => {
            return as_void_fn(lfx_AcquireNextImageKHR as vk::PFN_vkAcquireNextImageKHR)
        }
        b"vkAcquireNextImage2KHR" => {
            return as_void_fn(lfx_AcquireNextImage2KHR as vk::PFN_vkAcquireNextImage2KHR)
        }
        _ => {}
    }

    let key = dispatch_key(device.as_raw());
    let gdpa = runtime()
        .layer_state
        .lock()
        .device_dispatch
        .get(&key)
        .map(|d| d.get_device_proc_addr);
    match gdpa {
        Some(f) => f(device, p_name),
        None => None,
    }
}

/// Entry point named by the layer manifest for instance-chain dispatch.
///
/// # Safety
/// Called by the loader with a valid name pointer.
#[no_mangle]
pub unsafe extern "system" fn lfx_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = CStr::from_ptr(p_name);
    match name.to_bytes() {
        b"vkGetInstanceProcAddr" => {
            return as_void_fn(lfx_GetInstanceProcAddr as vk::PFN_vkGetInstanceProcAddr)
        }
        b"vkEnumerateInstanceLayerProperties" => {
            return as_void_fn(
                lfx_EnumerateInstanceLayerProperties as vk::PFN_vkEnumerateInstanceLayerProperties,
            )
        }
        b"vkEnumerateInstanceExtensionProperties" => {
            return as_void_fn(
                lfx_EnumerateInstanceExtensionProperties
                    as vk::PFN_vkEnumerateInstanceExtensionProperties,
            )
        }
        b"vkCreateInstance" => return as_void_fn(lfx_CreateInstance as vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => {
            return as_void_fn(lfx_DestroyInstance as vk::PFN_vkDestroyInstance)
        }
        b"vkGetDeviceProcAddr" => {
            return as_void_fn(lfx_GetDeviceProcAddr as vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkEnumerateDeviceLayerProperties" => {
            return as_void_fn(
                lfx_EnumerateDeviceLayerProperties as vk::PFN_vkEnumerateDeviceLayerProperties,
            )
        }
        b"vkEnumerateDeviceExtensionProperties" => {
            return as_void_fn(
                lfx_EnumerateDeviceExtensionProperties
                    as vk::PFN_vkEnumerateDeviceExtensionProperties,
            )
        }
        b"vkCreateDevice" => return as_void_fn(lfx_CreateDevice as vk::PFN_vkCreateDevice),
        b"vkDestroyDevice" => return as_void_fn(lfx_DestroyDevice as vk::PFN_vkDestroyDevice),
        b"vkQueuePresentKHR" => {
            return as_void_fn(lfx_QueuePresentKHR as vk::PFN_vkQueuePresentKHR)
        }
        b"vkAcquireNextImageKHR" => {
            return as_void_fn(lfx_AcquireNextImageKHR as vk::PFN_vkAcquireNextImageKHR)
        }
        b"vkAcquireNextImage2KHR" => {
            return as_void_fn(lfx_AcquireNextImage2KHR as vk::PFN_vkAcquireNextImage2KHR)
        }
        _ => {}
    }

    let key = dispatch_key(instance.as_raw());
    let gipa = runtime()
        .layer_state
        .lock()
        .instance_dispatch
        .get(&key)
        .map(|d| d.get_instance_proc_addr);
    match gipa {
        Some(f) => f(instance, p_name),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_reports_exactly_one_layer() {
        let mut count = 0u32;
        let res = unsafe { lfx_EnumerateInstanceLayerProperties(&mut count, ptr::null_mut()) };
        assert_eq!(res, vk::Result::SUCCESS);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_enumerate_fills_layer_record() {
        let mut count = 1u32;
        let mut props = vk::LayerProperties::default();
        let res = unsafe { lfx_EnumerateInstanceLayerProperties(&mut count, &mut props) };
        assert_eq!(res, vk::Result::SUCCESS);
        let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
        assert_eq!(name, LAYER_NAME);
        assert_eq!(props.implementation_version, 1);
    }

    #[test]
    fn test_extension_enumeration_rejects_other_layers() {
        let mut count = 0u32;
        let res = unsafe {
            lfx_EnumerateInstanceExtensionProperties(
                c"VK_LAYER_KHRONOS_validation".as_ptr(),
                &mut count,
                ptr::null_mut(),
            )
        };
        assert_eq!(res, vk::Result::ERROR_LAYER_NOT_PRESENT);
    }

    #[test]
    fn test_extension_enumeration_exposes_nothing() {
        let mut count = 99u32;
        let res = unsafe {
            lfx_EnumerateInstanceExtensionProperties(
                LAYER_NAME.as_ptr(),
                &mut count,
                ptr::null_mut(),
            )
        };
        assert_eq!(res, vk::Result::SUCCESS);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_get_instance_proc_addr_resolves_intercepts() {
        let f = unsafe {
            lfx_GetInstanceProcAddr(vk::Instance::null(), c"vkCreateInstance".as_ptr())
        };
        assert!(f.is_some());
    }
}
