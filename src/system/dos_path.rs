//! NT device paths to DOS paths.
//!
//! Object names come back as `\Device\HarddiskVolume3\Windows\notepad.exe`;
//! users expect `C:\Windows\notepad.exe`.

/// UNC redirector device
const MUP_DEVICE: &str = r"\Device\Mup";

/// Device prefix to drive mapping, e.g. `\Device\HarddiskVolume3` -> `C:`.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    entries: Vec<(String, String)>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: impl Into<String>, drive: impl Into<String>) {
        self.entries.push((device.into(), drive.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// DOS form of `nt_path`, or `None` if no known device matches.
    pub fn to_dos(&self, nt_path: &str) -> Option<String> {
        for (device, drive) in &self.entries {
            if let Some(rest) = strip_device(nt_path, device) {
                return Some(format!("{drive}{rest}"));
            }
        }
        strip_device(nt_path, MUP_DEVICE).map(|rest| format!(r"\{rest}"))
    }

    /// DOS form if known, otherwise the path unchanged.
    pub fn convert(&self, nt_path: &str) -> String {
        self.to_dos(nt_path).unwrap_or_else(|| nt_path.to_string())
    }

    /// Map the drive letters currently present on this system.
    #[cfg(windows)]
    pub fn from_system() -> Self {
        crate::system::winapi::drive_devices()
            .into_iter()
            .fold(Self::new(), |mut map, (device, drive)| {
                map.insert(device, drive);
                map
            })
    }
}

/// Rest of `path` after `device`, only on a component boundary.
fn strip_device<'a>(path: &'a str, device: &str) -> Option<&'a str> {
    let head = path.get(..device.len())?;
    if !head.eq_ignore_ascii_case(device) {
        return None;
    }
    let rest = &path[device.len()..];
    (rest.is_empty() || rest.starts_with('\\')).then_some(rest)
}
