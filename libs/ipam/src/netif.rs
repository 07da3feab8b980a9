// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Host network interface enumeration.

use std::{
    io,
    path::{Path, PathBuf},
};

#[cfg(test)]
use mockall::automock;

/// A host network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    /// Interface name, e.g. `eth0`.
    pub name: String,
    /// Hardware address as reported by the host.
    pub mac: String,
}

/// Lists the host's network interfaces.
#[cfg_attr(test, automock)]
pub trait InterfaceLister: Send + Sync {
    /// Returns the host interfaces, ordered lexicographically by name. The
    /// ordering is what makes wildcard matching deterministic.
    fn list(&self) -> io::Result<Vec<HostInterface>>;
}

/// An [InterfaceLister] reading the Linux sysfs network class directory.
pub struct SysfsInterfaceLister {
    root: PathBuf,
}

impl SysfsInterfaceLister {
    /// Creates a lister for the standard sysfs location.
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    /// Creates a lister rooted at `root`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for SysfsInterfaceLister {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceLister for SysfsInterfaceLister {
    fn list(&self) -> io::Result<Vec<HostInterface>> {
        let mut interfaces = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Interfaces without a hardware address cannot be matched against
            // the fabric document.
            let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) else {
                continue;
            };
            let mac = mac.trim().to_string();
            if mac.is_empty() {
                continue;
            }
            interfaces.push(HostInterface { name, mac });
        }

        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }
}

/// Canonicalizes a hardware address for comparison: separators stripped,
/// lowercased.
pub(crate) fn canonical_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect::<String>()
        .to_ascii_lowercase()
}
