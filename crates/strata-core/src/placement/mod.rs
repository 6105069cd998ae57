//! Layer placement across heterogeneous devices.
//!
//! The planner spreads decoder layers over an ordered list of devices
//! (fastest first), filling each device with the largest remaining
//! layers while it has room. A safety margin of twice the largest layer
//! is kept free on every device except the last, which absorbs whatever
//! is left even past its stated budget so planning always completes.
//!
//! Layers assigned to a device other than the compute device are staged
//! onto the compute device for each forward pass and released after.

use crate::error::{Result, StrataError};
use candle_core::Device;
use std::collections::BTreeMap;
use tracing::debug;

/// A device the planner may assign layers to.
#[derive(Debug, Clone)]
pub struct DeviceBudget {
    /// Device name, e.g. `"cuda:0"`, `"cpu"` or `"disk"`.
    name: String,
    /// Capacity in bytes.
    capacity_bytes: usize,
}

impl DeviceBudget {
    /// Create a device budget.
    pub fn new(name: impl Into<String>, capacity_bytes: usize) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
        }
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

/// Mapping from layer keys to device names.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    assignments: BTreeMap<String, String>,
}

impl DeviceMap {
    /// Device assigned to a layer key.
    pub fn device_for(&self, key: &str) -> Option<&str> {
        self.assignments.get(key).map(|s| s.as_str())
    }

    /// Iterate over (layer key, device name) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.assignments
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of assigned layers.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Insert an assignment (for hand-built maps).
    pub fn insert(&mut self, key: impl Into<String>, device: impl Into<String>) {
        self.assignments.insert(key.into(), device.into());
    }
}

/// Whether a layer's weights live on the compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Weights are already on the compute device.
    Resident,
    /// Weights live elsewhere and must be staged in per forward pass.
    NeedsLoad,
}

/// Plan a placement of layers onto devices.
///
/// `layer_sizes` pairs each layer key with its parameter bytes, in model
/// order. Devices are tried in the given order; within one device the
/// largest remaining layers are placed first (ties keep model order).
/// Filling stops once the free space drops below twice the largest
/// layer. Any layers still unassigned afterwards land on the last
/// device, ignoring its budget.
pub fn plan_layer_placement(
    layer_sizes: &[(String, usize)],
    devices: &[DeviceBudget],
) -> Result<DeviceMap> {
    if devices.is_empty() {
        return Err(StrataError::PlacementError(
            "at least one device is required".to_string(),
        ));
    }
    if layer_sizes.is_empty() {
        return Ok(DeviceMap::default());
    }

    let largest = layer_sizes.iter().map(|(_, s)| *s).max().unwrap_or(0);
    let margin = 2 * largest;

    // Largest first; stable sort keeps model order for equal sizes
    let mut order: Vec<usize> = (0..layer_sizes.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(layer_sizes[i].1));

    let mut map = DeviceMap::default();
    let mut assigned = vec![false; layer_sizes.len()];

    for device in devices {
        let mut free = device.capacity_bytes;
        for &idx in &order {
            if assigned[idx] {
                continue;
            }
            let (ref key, size) = layer_sizes[idx];
            if free >= size {
                map.insert(key.clone(), device.name.clone());
                assigned[idx] = true;
                free -= size;
            }
            if free < margin {
                break;
            }
        }
    }

    // Overflow: the last device takes everything that did not fit
    let last = &devices[devices.len() - 1];
    let mut overflow = 0usize;
    for (idx, done) in assigned.iter().enumerate() {
        if !done {
            map.insert(layer_sizes[idx].0.clone(), last.name.clone());
            overflow += 1;
        }
    }

    debug!(
        layers = layer_sizes.len(),
        devices = devices.len(),
        overflow,
        "layer placement planned"
    );
    Ok(map)
}

/// Resolve a device name to a candle device.
///
/// `"disk"` resolves to the CPU: weights parked there stay in host
/// memory until staged onto the compute device.
pub fn device_from_name(name: &str) -> Result<Device> {
    if name == "cpu" || name == "disk" {
        return Ok(Device::Cpu);
    }
    if let Some(ordinal) = name.strip_prefix("cuda:") {
        let ordinal: usize = ordinal.parse().map_err(|_| {
            StrataError::PlacementError(format!("invalid device name: {}", name))
        })?;
        return Ok(Device::new_cuda(ordinal)?);
    }
    if let Some(ordinal) = name.strip_prefix("metal:") {
        let ordinal: usize = ordinal.parse().map_err(|_| {
            StrataError::PlacementError(format!("invalid device name: {}", name))
        })?;
        return Ok(Device::new_metal(ordinal)?);
    }
    Err(StrataError::PlacementError(format!(
        "unknown device name: {}",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_sizes(sizes: &[usize]) -> Vec<(String, usize)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| (format!("layers.{}", i), s))
            .collect()
    }

    #[test]
    fn every_layer_gets_a_device() {
        let layers = layer_sizes(&[10, 20, 5, 15, 25, 8]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 60),
            DeviceBudget::new("cpu", 40),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();
        assert_eq!(map.len(), layers.len());
        for (key, _) in &layers {
            assert!(map.device_for(key).is_some(), "{} unassigned", key);
        }
    }

    #[test]
    fn non_final_devices_respect_budgets() {
        let layers = layer_sizes(&[10, 20, 5, 15, 25, 8, 12, 30]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 70),
            DeviceBudget::new("cpu", 50),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();

        for device in &devices[..devices.len() - 1] {
            let used: usize = layers
                .iter()
                .filter(|(key, _)| map.device_for(key) == Some(device.name()))
                .map(|(_, size)| *size)
                .sum();
            assert!(
                used <= device.capacity_bytes(),
                "{} over budget: {} > {}",
                device.name(),
                used,
                device.capacity_bytes()
            );
        }
    }

    #[test]
    fn filling_stops_at_safety_margin() {
        // Largest layer 10 leaves a margin of 20: a 35-byte device takes
        // two layers (free drops 35 -> 25 -> 15 < 20) and stops.
        let layers = layer_sizes(&[10, 10, 10, 10]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 35),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();
        let on_gpu = layers
            .iter()
            .filter(|(key, _)| map.device_for(key) == Some("cuda:0"))
            .count();
        assert_eq!(on_gpu, 2);
    }

    #[test]
    fn equal_sizes_keep_model_order() {
        // Margin 8; capacity 13 fits layers.0 (free 9) and layers.1
        // (free 5 < 8, stop); layers.2 overflows to disk.
        let layers = layer_sizes(&[4, 4, 4]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 13),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();
        assert_eq!(map.device_for("layers.0"), Some("cuda:0"));
        assert_eq!(map.device_for("layers.1"), Some("cuda:0"));
        assert_eq!(map.device_for("layers.2"), Some("disk"));
    }

    #[test]
    fn largest_layers_land_first() {
        let layers = layer_sizes(&[5, 50, 10]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 60),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();
        // The 50-byte layer is tried (and placed) before the smaller
        // ones; the 100-byte margin then closes the device.
        assert_eq!(map.device_for("layers.1"), Some("cuda:0"));
        assert_eq!(map.device_for("layers.0"), Some("disk"));
        assert_eq!(map.device_for("layers.2"), Some("disk"));
    }

    #[test]
    fn final_device_absorbs_overflow() {
        let layers = layer_sizes(&[40, 40, 40]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 10),
            DeviceBudget::new("cpu", 10),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();
        for (key, _) in &layers {
            assert_eq!(map.device_for(key), Some("cpu"));
        }
    }

    #[test]
    fn empty_device_list_is_an_error() {
        let layers = layer_sizes(&[10]);
        assert!(plan_layer_placement(&layers, &[]).is_err());
    }

    #[test]
    fn no_layers_gives_empty_map() {
        let devices = vec![DeviceBudget::new("cpu", 100)];
        let map = plan_layer_placement(&[], &devices).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn device_names_resolve() {
        assert!(matches!(device_from_name("cpu").unwrap(), Device::Cpu));
        assert!(matches!(device_from_name("disk").unwrap(), Device::Cpu));
        assert!(device_from_name("tpu:0").is_err());
        assert!(device_from_name("cuda:x").is_err());
    }

    #[test]
    fn three_tier_plan() {
        // A scaled-down accelerator / host / disk split: the accelerator
        // takes the big layers, the host the next tranche, disk the rest.
        let layers = layer_sizes(&[24, 24, 24, 24, 24, 24, 24, 24]);
        let devices = vec![
            DeviceBudget::new("cuda:0", 100),
            DeviceBudget::new("cpu", 80),
            DeviceBudget::new("disk", usize::MAX),
        ];

        let map = plan_layer_placement(&layers, &devices).unwrap();

        let count_on = |device: &str| {
            layers
                .iter()
                .filter(|(key, _)| map.device_for(key) == Some(device))
                .count()
        };

        // Margin 48: cuda fills 100 -> 76 -> 52 (stop at 52? 52 >= 48,
        // one more: 28 < 48 stop) = 3 layers; cpu 80 -> 56 -> 32 < 48 = 2.
        assert_eq!(count_on("cuda:0"), 3);
        assert_eq!(count_on("cpu"), 2);
        assert_eq!(count_on("disk"), 3);
    }
}
