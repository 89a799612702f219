//! Volume and pool configuration schemas.
//!
//! Config maps are string key/value bags, but the set of recognized keys is
//! closed per volume kind. Unknown keys are rejected at validation time with
//! one exception: the reserved `user.` prefix is always accepted and passed
//! through unvalidated.

use std::collections::HashMap;

use crate::error::{Result, StorageError};
use crate::types::{ContentType, VolumeType};

/// Free-form namespace prefix, never validated.
pub const USER_CONFIG_PREFIX: &str = "user.";

/// Keys valid for every volume type.
const COMMON_VOLUME_KEYS: &[&str] = &["size", "volatile.uuid"];

/// Extra keys valid for filesystem-content volumes.
const FILESYSTEM_VOLUME_KEYS: &[&str] = &[
    "block.filesystem",
    "block.mount_options",
    "initial.uid",
    "initial.gid",
    "initial.mode",
];

/// Extra keys valid for instance root volumes.
const INSTANCE_VOLUME_KEYS: &[&str] = &[
    "size.state",
    "volatile.idmap.last",
    "volatile.idmap.next",
];

/// Extra keys valid for custom volumes.
const CUSTOM_VOLUME_KEYS: &[&str] = &[
    "snapshots.expiry",
    "security.shifted",
    "security.unmapped",
    "security.shared",
];

/// Extra keys valid for cached image volumes.
const IMAGE_VOLUME_KEYS: &[&str] = &["volatile.image.size"];

/// Keys valid for pool config, besides `volume.*` defaults.
const POOL_KEYS: &[&str] = &["source", "size", "rsync.bwlimit"];

pub(crate) fn volume_key_recognized(
    vol_type: VolumeType,
    content_type: ContentType,
    key: &str,
    driver_keys: &[String],
) -> bool {
    if COMMON_VOLUME_KEYS.contains(&key) {
        return true;
    }

    if content_type == ContentType::Filesystem && FILESYSTEM_VOLUME_KEYS.contains(&key) {
        return true;
    }

    let extra: &[&str] = match vol_type {
        VolumeType::Container | VolumeType::VirtualMachine => INSTANCE_VOLUME_KEYS,
        VolumeType::Custom => CUSTOM_VOLUME_KEYS,
        VolumeType::Image => IMAGE_VOLUME_KEYS,
        VolumeType::Bucket => &[],
    };

    extra.contains(&key) || driver_keys.iter().any(|k| k == key)
}

/// Validate a volume config map against the kind's key schema.
///
/// `driver_keys` lists additional keys declared valid by the pool's driver.
pub fn validate_volume_config(
    vol_type: VolumeType,
    content_type: ContentType,
    config: &HashMap<String, String>,
    driver_keys: &[String],
) -> Result<()> {
    for (key, value) in config {
        if key.starts_with(USER_CONFIG_PREFIX) {
            continue;
        }

        if !volume_key_recognized(vol_type, content_type, key, driver_keys) {
            return Err(StorageError::InvalidConfig(format!(
                "Unknown configuration key {key:?} for {vol_type} volume"
            )));
        }

        if key == "size" || key == "size.state" || key == "volatile.image.size" {
            parse_size(value).map_err(|e| {
                StorageError::InvalidConfig(format!("Invalid value for {key:?}: {e}"))
            })?;
        }
    }

    Ok(())
}

/// Strip config keys the kind's schema does not recognize.
///
/// Used when applying config that originated on another pool (migration
/// receive, backup restore): foreign driver keys are dropped rather than
/// rejected. `user.` keys always survive.
pub fn strip_unknown_volume_config(
    vol_type: VolumeType,
    content_type: ContentType,
    config: &HashMap<String, String>,
    driver_keys: &[String],
) -> HashMap<String, String> {
    config
        .iter()
        .filter(|(key, _)| {
            key.starts_with(USER_CONFIG_PREFIX)
                || volume_key_recognized(vol_type, content_type, key, driver_keys)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Validate a pool config map.
///
/// Pool config accepts its own keys plus `volume.<key>` defaults for any key
/// valid on a custom volume of either content type.
pub fn validate_pool_config(
    config: &HashMap<String, String>,
    driver_keys: &[String],
) -> Result<()> {
    for key in config.keys() {
        if key.starts_with(USER_CONFIG_PREFIX) {
            continue;
        }

        if POOL_KEYS.contains(&key.as_str()) || driver_keys.iter().any(|k| k == key) {
            continue;
        }

        if let Some(vol_key) = key.strip_prefix("volume.") {
            let fs_ok =
                volume_key_recognized(VolumeType::Custom, ContentType::Filesystem, vol_key, &[]);
            let block_ok =
                volume_key_recognized(VolumeType::Custom, ContentType::Block, vol_key, &[]);
            if fs_ok || block_ok {
                continue;
            }
        }

        return Err(StorageError::InvalidConfig(format!(
            "Unknown configuration key {key:?} for storage pool"
        )));
    }

    Ok(())
}

/// Diff two config maps.
///
/// Returns the changed keys (deleted keys appear with an empty string value)
/// and whether every changed key lives in the `user.` namespace.
pub fn detect_changed_config(
    cur: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> (HashMap<String, String>, bool) {
    let mut changed = HashMap::new();
    let mut user_only = true;
    let empty = String::new();

    for key in cur.keys().chain(new.keys()) {
        let cur_val = cur.get(key).unwrap_or(&empty);
        let new_val = new.get(key).unwrap_or(&empty);
        if cur_val != new_val {
            if !key.starts_with(USER_CONFIG_PREFIX) {
                user_only = false;
            }
            changed.insert(key.clone(), new_val.clone());
        }
    }

    (changed, user_only)
}

/// Parse a byte size string.
///
/// Accepts a plain byte count ("1048576"), SI suffixes ("10MB", "2GB") and
/// IEC suffixes ("10MiB", "2GiB"). A lone "B" suffix is also accepted.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StorageError::InvalidConfig("Empty size value".to_string()));
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);

    let count: u64 = digits
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("Invalid size value {value:?}")))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000u64.pow(4),
        "PB" => 1000u64.pow(5),
        "KiB" => 1024,
        "MiB" => 1024 * 1024,
        "GiB" => 1024 * 1024 * 1024,
        "TiB" => 1024u64.pow(4),
        "PiB" => 1024u64.pow(5),
        other => {
            return Err(StorageError::InvalidConfig(format!(
                "Invalid size suffix {other:?}"
            )))
        }
    };

    count.checked_mul(multiplier).ok_or_else(|| {
        StorageError::InvalidConfig(format!("Size value {value:?} overflows"))
    })
}
