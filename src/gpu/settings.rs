use std::env;

#[cfg(feature = "palcore-serde")]
use serde::{Deserialize, Serialize};

use crate::GpuHeap;

/// Client interface version negotiated at context creation.
///
/// Selects which optional create-info fields and operations are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub struct InterfaceVersion(pub u32);

impl InterfaceVersion {
    pub const CURRENT: Self = Self(622);

    /// Compute create info resolves `indirect_funcs` at creation time.
    pub fn resolves_indirect_funcs_at_creation(self) -> bool {
        self.0 < 556
    }

    /// `set_stack_size_in_bytes` and `max_function_call_depth` are honoured.
    pub fn supports_stack_size_override(self) -> bool {
        self.0 >= 580
    }

    pub fn supports_partial_dispatch_preemption_control(self) -> bool {
        self.0 >= 622
    }
}

impl Default for InterfaceVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub struct Settings {
    pub interface_version: InterfaceVersion,
    /// Keep a copy of each pipeline binary so it can be read back.
    pub retain_code_object: bool,
    /// Heap pipelines are uploaded to unless they override it.
    pub default_pipeline_heap: GpuHeap,
    /// Reject binaries whose pipeline hash is zero.
    pub validate_hashes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface_version: InterfaceVersion::CURRENT,
            retain_code_object: true,
            default_pipeline_heap: GpuHeap::Invisible,
            validate_hashes: true,
        }
    }
}

impl Settings {
    pub fn with_interface_version(mut self, version: u32) -> Self {
        self.interface_version = InterfaceVersion(version);
        self
    }

    pub fn with_retain_code_object(mut self, retain: bool) -> Self {
        self.retain_code_object = retain;
        self
    }

    pub fn with_default_pipeline_heap(mut self, heap: GpuHeap) -> Self {
        self.default_pipeline_heap = heap;
        self
    }

    pub fn with_validate_hashes(mut self, validate: bool) -> Self {
        self.validate_hashes = validate;
        self
    }

    /// Defaults overridden by `PALCORE_INTERFACE_VERSION`,
    /// `PALCORE_RETAIN_CODE_OBJECT` and `PALCORE_PIPELINE_HEAP`.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(value) = env::var("PALCORE_INTERFACE_VERSION") {
            match value.trim().parse::<u32>() {
                Ok(v) => settings.interface_version = InterfaceVersion(v),
                Err(_) => log::warn!("ignoring PALCORE_INTERFACE_VERSION={:?}", value),
            }
        }

        if let Ok(value) = env::var("PALCORE_RETAIN_CODE_OBJECT") {
            match parse_bool(&value) {
                Some(v) => settings.retain_code_object = v,
                None => log::warn!("ignoring PALCORE_RETAIN_CODE_OBJECT={:?}", value),
            }
        }

        if let Ok(value) = env::var("PALCORE_PIPELINE_HEAP") {
            match value.parse::<GpuHeap>() {
                Ok(heap) => settings.default_pipeline_heap = heap,
                Err(_) => log::warn!("ignoring PALCORE_PIPELINE_HEAP={:?}", value),
            }
        }

        settings
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gates() {
        let old = InterfaceVersion(550);
        assert!(old.resolves_indirect_funcs_at_creation());
        assert!(!old.supports_stack_size_override());

        let current = InterfaceVersion::CURRENT;
        assert!(!current.resolves_indirect_funcs_at_creation());
        assert!(current.supports_stack_size_override());
        assert!(current.supports_partial_dispatch_preemption_control());
    }

    #[test]
    fn bools_parse() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
