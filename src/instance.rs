//! Instance/physical-device/surface bring-up.
//!
//! Grounded directly on the teacher's `vulkan/lib.rs` `Instance`,
//! `PhysicalDevice` and `Surface` types and `select_queue_families`;
//! generalized here to reject (rather than silently accept) a physical
//! device missing a required extension, per spec.md §9 Open Question 1: a
//! device is accepted only if *every* required extension is available, with
//! no `continue`-in-nested-loop mistranslation.

use std::ffi::{c_void, CStr, CString};

use ash::{ext::debug_utils, khr, vk};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{Error, Result};
use crate::types::QueueKind;

pub struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    pub fn new(display_handle: RawDisplayHandle, app_name: &str) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().map_err(|e| Error::Other(e.into()))? };

        let app_name = CString::new(app_name).unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        extension_names.push(debug_utils::NAME.as_ptr());
        // Extension names may legitimately repeat across required-extension
        // sets supplied by different window-system backends; dedup before
        // handing the list to Vulkan (spec.md §9 Open Question 2).
        extension_names.sort();
        extension_names.dedup();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }

    pub fn enumerate_physical_devices(&self, surface: &Surface) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|raw| PhysicalDevice::new_from_vulkan_handle(&self.raw, surface, raw))
            .collect()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[vk][{:?}] {:?}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[vk][{:?}] {:?}", message_type, message)
        }
        _ => log::debug!("[vk][{:?}] {:?}", message_type, message),
    }
    vk::FALSE
}

#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub(crate) queue_families: Vec<QueueFamily>,
    supported_extensions: Vec<String>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(
        instance: &ash::Instance,
        surface: &Surface,
        raw: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("<unknown>")
                .to_owned()
        };

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, properties)| {
                let present_support = unsafe {
                    surface.raw_ash.get_physical_device_surface_support(
                        raw,
                        index as u32,
                        surface.raw_vulkan,
                    )?
                };
                Ok(QueueFamily {
                    index: index as u32,
                    properties,
                    present_support,
                })
            })
            .collect::<Result<_>>()?;

        let extension_properties = unsafe { instance.enumerate_device_extension_properties(raw)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|prop| {
                unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        Ok(Self {
            raw,
            name,
            device_type: properties.device_type,
            limits: properties.limits,
            queue_families,
            supported_extensions,
        })
    }

    /// A device is accepted only if every requested extension is present;
    /// no partial matches, no early `continue` that leaves the candidate
    /// half-checked (spec.md §9 Open Question 1).
    pub fn supports_extensions(&self, extensions: &[&str]) -> bool {
        extensions
            .iter()
            .all(|ext| self.supported_extensions.iter().any(|s| s == ext))
    }

    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    pub present_support: bool,
}

impl QueueFamily {
    pub fn supports(&self, kind: QueueKind) -> bool {
        match kind {
            QueueKind::Graphics => self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            QueueKind::Compute => self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE),
            QueueKind::Transfer => self.properties.queue_flags.contains(vk::QueueFlags::TRANSFER),
            QueueKind::External => false,
        }
    }
}

/// Selects the first discrete GPU; falls back to the first device offered
/// if no discrete GPU is present.
pub fn select_preferred_gpu(devices: &[PhysicalDevice]) -> Result<PhysicalDevice> {
    devices
        .iter()
        .find(|d| d.is_discrete())
        .or_else(|| devices.first())
        .cloned()
        .ok_or_else(|| Error::InvalidArgument("no physical devices found".into()))
}

pub struct Surface {
    pub(crate) raw_ash: khr::surface::Instance,
    pub(crate) raw_vulkan: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        instance: &Instance,
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
    ) -> Result<Self> {
        let raw_ash = khr::surface::Instance::new(&instance.entry, &instance.raw);
        let raw_vulkan = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                display_handle,
                window_handle,
                None,
            )?
        };

        Ok(Self {
            raw_ash,
            raw_vulkan,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.raw_ash.destroy_surface(self.raw_vulkan, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_support_requires_all() {
        let pd = PhysicalDevice {
            raw: vk::PhysicalDevice::null(),
            name: "test".into(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            limits: unsafe { std::mem::zeroed() },
            queue_families: vec![],
            supported_extensions: vec!["VK_KHR_swapchain".into(), "VK_KHR_maintenance4".into()],
        };

        assert!(pd.supports_extensions(&["VK_KHR_swapchain"]));
        assert!(pd.supports_extensions(&["VK_KHR_swapchain", "VK_KHR_maintenance4"]));
        assert!(!pd.supports_extensions(&["VK_KHR_swapchain", "VK_KHR_ray_query"]));
    }
}
