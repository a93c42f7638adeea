//! Configuration Manager (cm)
//!
//! Registry emulation backed by a host JSON file. The file maps
//! backslash-delimited key paths (case- and separator-insensitive) to
//! objects of value name -> `{ "type": <REG_TYPE>, "value": <string|number> }`:
//!
//! ```json
//! {
//!   "_comment": "keys starting with _ are ignored",
//!   "software\\ea games\\motor city online": {
//!     "installdir": { "type": "REG_SZ", "value": "C:\\MCity" },
//!     "patchlevel": { "type": "REG_DWORD", "value": 3 }
//!   }
//! }
//! ```
//!
//! Opened handles carry the concatenated path of their parents;
//! `RegQueryValueExA` matches the stored key that is the most specific
//! suffix of the opened path. Missing keys and values come back as
//! `ERROR_FILE_NOT_FOUND`. A missing registry file is non-fatal.

use std::collections::HashMap;
use std::path::Path;

/// ERROR_SUCCESS
pub const ERROR_SUCCESS: u32 = 0;
/// ERROR_FILE_NOT_FOUND
pub const ERROR_FILE_NOT_FOUND: u32 = 2;

/// Registry value type constants
pub mod reg_type {
    /// No type
    pub const REG_NONE: u32 = 0;
    /// Zero-terminated string
    pub const REG_SZ: u32 = 1;
    /// String with environment references
    pub const REG_EXPAND_SZ: u32 = 2;
    /// Raw bytes
    pub const REG_BINARY: u32 = 3;
    /// 32-bit little-endian integer
    pub const REG_DWORD: u32 = 4;
    /// Multiple zero-terminated strings
    pub const REG_MULTI_SZ: u32 = 7;
}

/// Predefined root key handles
pub mod root_keys {
    /// HKEY_CLASSES_ROOT
    pub const HKEY_CLASSES_ROOT: u32 = 0x8000_0000;
    /// HKEY_CURRENT_USER
    pub const HKEY_CURRENT_USER: u32 = 0x8000_0001;
    /// HKEY_LOCAL_MACHINE
    pub const HKEY_LOCAL_MACHINE: u32 = 0x8000_0002;
    /// HKEY_USERS
    pub const HKEY_USERS: u32 = 0x8000_0003;
    /// HKEY_CURRENT_CONFIG
    pub const HKEY_CURRENT_CONFIG: u32 = 0x8000_0005;
}

/// One registry value
#[derive(Debug, Clone, PartialEq)]
pub enum RegData {
    /// REG_DWORD payload
    Dword(u32),
    /// REG_SZ / REG_EXPAND_SZ payload
    Sz(String),
}

/// A typed registry value
#[derive(Debug, Clone, PartialEq)]
pub struct RegValue {
    /// REG_* type code
    pub kind: u32,
    /// Payload
    pub data: RegData,
}

/// The registry store and the open-handle table
#[derive(Debug, Default)]
pub struct Registry {
    /// Normalized key path -> (lowercased value name -> value)
    keys: HashMap<String, HashMap<String, RegValue>>,
    /// Open handle -> full normalized path
    handles: HashMap<u32, String>,
    next_handle: u32,
}

/// Lowercase, backslash-normalize, and trim a key path
fn normalize(path: &str) -> String {
    path.to_lowercase()
        .replace('/', "\\")
        .trim_matches('\\')
        .to_string()
}

/// Root-handle path prefix, if `handle` is predefined
fn root_path(handle: u32) -> Option<&'static str> {
    match handle {
        root_keys::HKEY_CLASSES_ROOT => Some("hkey_classes_root"),
        root_keys::HKEY_CURRENT_USER => Some("hkey_current_user"),
        root_keys::HKEY_LOCAL_MACHINE => Some("hkey_local_machine"),
        root_keys::HKEY_USERS => Some("hkey_users"),
        root_keys::HKEY_CURRENT_CONFIG => Some("hkey_current_config"),
        _ => None,
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 0x0000_4000,
        }
    }

    /// Load the backing JSON file; a missing file leaves the store empty
    pub fn load_file(&mut self, path: &Path) {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                log::info!("[CM] no registry file at {}: {err}", path.display());
                return;
            }
        };
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => self.load_json(&value),
            Err(err) => log::warn!("[CM] malformed registry file {}: {err}", path.display()),
        }
    }

    /// Ingest a parsed JSON document
    pub fn load_json(&mut self, doc: &serde_json::Value) {
        let Some(map) = doc.as_object() else {
            log::warn!("[CM] registry document is not an object");
            return;
        };
        for (key, values) in map {
            if key.starts_with('_') {
                continue; // comment entry
            }
            let Some(values) = values.as_object() else {
                continue;
            };
            let mut parsed = HashMap::new();
            for (name, spec) in values {
                if let Some(value) = parse_value(spec) {
                    parsed.insert(name.to_lowercase(), value);
                }
            }
            self.keys.insert(normalize(key), parsed);
        }
        log::debug!("[CM] loaded {} registry keys", self.keys.len());
    }

    /// Open (or create) a key below `parent`; returns a new handle
    ///
    /// Creation is the same as opening: the synthetic handle records the
    /// path, and the backing store is never written.
    pub fn open_key(&mut self, parent: u32, subkey: &str) -> Option<u32> {
        let base = match root_path(parent) {
            Some(root) => root.to_string(),
            None => self.handles.get(&parent)?.clone(),
        };
        let sub = normalize(subkey);
        let full = if sub.is_empty() {
            base
        } else {
            format!("{base}\\{sub}")
        };
        let handle = self.next_handle;
        self.next_handle += 4;
        log::debug!("[CM] open {full} -> handle {handle:#x}");
        self.handles.insert(handle, full);
        Some(handle)
    }

    /// Close an open handle
    pub fn close_key(&mut self, handle: u32) -> u32 {
        if self.handles.remove(&handle).is_some() || root_path(handle).is_some() {
            ERROR_SUCCESS
        } else {
            ERROR_FILE_NOT_FOUND
        }
    }

    /// Full path of an open handle
    pub fn path_of(&self, handle: u32) -> Option<String> {
        if let Some(root) = root_path(handle) {
            return Some(root.to_string());
        }
        self.handles.get(&handle).cloned()
    }

    /// Query a value: the stored key that is the longest suffix of the
    /// opened path wins
    pub fn query(&self, handle: u32, value_name: &str) -> Option<&RegValue> {
        let full = self.path_of(handle)?;
        let needle = value_name.to_lowercase();
        let mut best: Option<(&String, &HashMap<String, RegValue>)> = None;
        for (key, values) in &self.keys {
            let matches = full == *key
                || full
                    .strip_suffix(key.as_str())
                    .is_some_and(|rest| rest.ends_with('\\'));
            if matches && best.map_or(true, |(b, _)| key.len() > b.len()) {
                best = Some((key, values));
            }
        }
        best.and_then(|(_, values)| values.get(&needle))
    }
}

/// Parse one `{ "type": ..., "value": ... }` record
fn parse_value(spec: &serde_json::Value) -> Option<RegValue> {
    let obj = spec.as_object()?;
    let kind = match obj.get("type")? {
        serde_json::Value::String(s) => match s.as_str() {
            "REG_SZ" => reg_type::REG_SZ,
            "REG_EXPAND_SZ" => reg_type::REG_EXPAND_SZ,
            "REG_DWORD" => reg_type::REG_DWORD,
            "REG_BINARY" => reg_type::REG_BINARY,
            "REG_MULTI_SZ" => reg_type::REG_MULTI_SZ,
            _ => reg_type::REG_NONE,
        },
        serde_json::Value::Number(n) => n.as_u64()? as u32,
        _ => return None,
    };
    let value = obj.get("value")?;
    let data = if kind == reg_type::REG_DWORD {
        let n = match value {
            serde_json::Value::Number(n) => n.as_u64()? as u32,
            serde_json::Value::String(s) => {
                let s = s.trim();
                if let Some(hex) = s.strip_prefix("0x") {
                    u32::from_str_radix(hex, 16).ok()?
                } else {
                    s.parse().ok()?
                }
            }
            _ => return None,
        };
        RegData::Dword(n)
    } else {
        RegData::Sz(value.as_str()?.to_string())
    };
    Some(RegValue { kind, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Registry {
        let doc: serde_json::Value = serde_json::from_str(
            r#"{
                "_comment": "ignored",
                "software\\ea games\\motor city online": {
                    "InstallDir": { "type": "REG_SZ", "value": "C:\\MCity" },
                    "PatchLevel": { "type": "REG_DWORD", "value": 3 }
                },
                "software\\ea games": {
                    "Locale": { "type": "REG_SZ", "value": "en" }
                }
            }"#,
        )
        .unwrap();
        let mut reg = Registry::new();
        reg.load_json(&doc);
        reg
    }

    #[test]
    fn test_open_concatenates_paths() {
        let mut reg = sample();
        let software = reg
            .open_key(root_keys::HKEY_LOCAL_MACHINE, "SOFTWARE")
            .unwrap();
        let mco = reg
            .open_key(software, "EA Games/Motor City Online")
            .unwrap();
        assert_eq!(
            reg.path_of(mco).unwrap(),
            "hkey_local_machine\\software\\ea games\\motor city online"
        );
    }

    #[test]
    fn test_suffix_match_most_specific() {
        let mut reg = sample();
        let mco = reg
            .open_key(
                root_keys::HKEY_LOCAL_MACHINE,
                "Software\\EA Games\\Motor City Online",
            )
            .unwrap();
        // Both stored keys are suffixes of the parent chain; only the most
        // specific one carries InstallDir.
        let v = reg.query(mco, "installdir").unwrap();
        assert_eq!(v.data, RegData::Sz("C:\\MCity".into()));
        let v = reg.query(mco, "PatchLevel").unwrap();
        assert_eq!(v.data, RegData::Dword(3));
    }

    #[test]
    fn test_missing_value_is_none() {
        let mut reg = sample();
        let k = reg
            .open_key(root_keys::HKEY_LOCAL_MACHINE, "software\\ea games")
            .unwrap();
        assert!(reg.query(k, "nope").is_none());
        assert_eq!(reg.query(k, "locale").unwrap().kind, reg_type::REG_SZ);
    }

    #[test]
    fn test_close_key() {
        let mut reg = sample();
        let k = reg.open_key(root_keys::HKEY_CURRENT_USER, "x").unwrap();
        assert_eq!(reg.close_key(k), ERROR_SUCCESS);
        assert_eq!(reg.close_key(k), ERROR_FILE_NOT_FOUND);
        assert_eq!(reg.close_key(root_keys::HKEY_CURRENT_USER), ERROR_SUCCESS);
    }

    #[test]
    fn test_comment_keys_skipped() {
        let reg = sample();
        assert!(!reg.keys.contains_key("_comment"));
    }
}
