//! Object Dictionary for the mock CANopen node
//!
//! This module defines the simulated object dictionary with test data.

use std::collections::HashMap;

use rand::Rng;

/// Represents a single entry in the object dictionary
pub enum ObjectEntry {
    /// Static value that doesn't change
    Static(Vec<u8>),
    /// Dynamic value generated on each read
    Dynamic(Box<dyn Fn() -> Vec<u8> + Send + Sync>),
    /// Value the client may overwrite via SDO download
    Writable(Vec<u8>),
}

/// Object dictionary mapping (index, subindex) to values
#[derive(Default)]
pub struct ObjectDictionary {
    entries: HashMap<(u16, u8), ObjectEntry>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a static entry to the dictionary
    pub fn add_static(&mut self, index: u16, subindex: u8, data: Vec<u8>) {
        self.entries.insert((index, subindex), ObjectEntry::Static(data));
    }

    /// Add a dynamic entry (value generated on each read)
    pub fn add_dynamic<F>(&mut self, index: u16, subindex: u8, generator: F)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.entries
            .insert((index, subindex), ObjectEntry::Dynamic(Box::new(generator)));
    }

    /// Add a writable entry with an initial value
    pub fn add_writable(&mut self, index: u16, subindex: u8, data: Vec<u8>) {
        self.entries.insert((index, subindex), ObjectEntry::Writable(data));
    }

    /// Get an entry's current value
    pub fn get(&self, index: u16, subindex: u8) -> Option<Vec<u8>> {
        self.entries.get(&(index, subindex)).map(|entry| match entry {
            ObjectEntry::Static(data) | ObjectEntry::Writable(data) => data.clone(),
            ObjectEntry::Dynamic(generator) => generator(),
        })
    }

    /// Overwrite a writable entry. `Ok` on success, `Err(true)` if the
    /// entry exists but is read-only, `Err(false)` if it doesn't exist.
    pub fn write(&mut self, index: u16, subindex: u8, data: Vec<u8>) -> Result<(), bool> {
        match self.entries.get_mut(&(index, subindex)) {
            Some(ObjectEntry::Writable(stored)) => {
                *stored = data;
                Ok(())
            }
            Some(_) => Err(true),
            None => Err(false),
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Print a summary of all objects
    pub fn print_summary(&self) {
        let mut indices: Vec<_> = self.entries.keys().collect();
        indices.sort();

        for (index, subindex) in indices {
            let entry_type = match &self.entries[&(*index, *subindex)] {
                ObjectEntry::Static(data) => format!("Static ({} bytes)", data.len()),
                ObjectEntry::Dynamic(_) => "Dynamic".to_string(),
                ObjectEntry::Writable(data) => format!("Writable ({} bytes)", data.len()),
            };
            println!("  0x{:04X}:{:02X} - {}", index, subindex, entry_type);
        }
    }

    /// Add standard test objects for demonstration
    pub fn add_test_objects(&mut self) {
        // 0x1000:00 - Device Type (UInt32) - Static
        self.add_static(0x1000, 0x00, 0x00000191u32.to_le_bytes().to_vec());

        // 0x1001:00 - Error Register (UInt8) - Static
        self.add_static(0x1001, 0x00, vec![0x00]);

        // 0x1008:00 - Device Name (String) - Static, longer than four
        // bytes so reads exercise the segmented upload path
        let device_name = "MockCANopenNode";
        self.add_static(0x1008, 0x00, device_name.as_bytes().to_vec());

        // 0x1017:00 - Producer Heartbeat Time (UInt16) - Writable
        self.add_writable(0x1017, 0x00, 100u16.to_le_bytes().to_vec());

        // 0x1018:01 - Vendor ID (UInt32) - Static
        self.add_static(0x1018, 0x01, 0x00000001u32.to_le_bytes().to_vec());

        // 0x2000:01 - Temperature Sensor (Real32) - Dynamic
        self.add_dynamic(0x2000, 0x01, || {
            let mut rng = rand::rng();
            let temp: f32 = rng.random_range(20.0..30.0);
            temp.to_le_bytes().to_vec()
        });

        // 0x2000:02 - Pressure Sensor (Real32) - Dynamic
        self.add_dynamic(0x2000, 0x02, || {
            let mut rng = rand::rng();
            let pressure: f32 = rng.random_range(95.0..105.0);
            pressure.to_le_bytes().to_vec()
        });

        // 0x2001:01 - Counter (UInt32) - Dynamic (incrementing)
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        self.add_dynamic(0x2001, 0x01, move || {
            let value = counter_clone.fetch_add(1, Ordering::SeqCst);
            value.to_le_bytes().to_vec()
        });

        // 0x2003:01 - Status Word (UInt16) - Writable
        self.add_writable(0x2003, 0x01, 0x0031u16.to_le_bytes().to_vec());

        // 0x2006:00 - Device Label (String) - Writable, long enough for
        // segmented downloads
        self.add_writable(0x2006, 0x00, b"unnamed".to_vec());
    }
}
