//! Extended-inquiry / advertisement data helpers.
//!
//! Both Classic EIR and BLE advertising payloads are a sequence of
//! `[len][type][data...]` AD structures, so the same walker serves the
//! pairing filter and the BLE scanner.

use super::{device_name, DeviceName};

/// AD type: Shortened Local Name.
pub const AD_SHORT_NAME: u8 = 0x08;
/// AD type: Complete Local Name.
pub const AD_COMPLETE_NAME: u8 = 0x09;
/// AD type: GAP Appearance (2 bytes LE).
pub const AD_APPEARANCE: u8 = 0x19;

/// Major device class: phone.
pub const MAJOR_CLASS_PHONE: u32 = 0x02;
/// Major device class: audio/video.
pub const MAJOR_CLASS_AV: u32 = 0x04;

/// Class of device reported for a BLE peer advertising a phone appearance
/// (major phone, minor smartphone).
pub const COD_SMARTPHONE: u32 = 0x00_02_0C;
/// Class of device reported for a BLE peer advertising an audio appearance
/// (major audio/video, minor wearable headset).
pub const COD_HEADSET: u32 = 0x00_04_04;

/// Return the payload of the first AD structure of type `ad_type`.
pub fn find_field(data: &[u8], ad_type: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        if data[i + 1] == ad_type {
            return Some(&data[i + 2..i + 1 + len]);
        }
        i += len + 1;
    }
    None
}

fn name_from_bytes(bytes: &[u8]) -> Option<DeviceName> {
    let text = match core::str::from_utf8(bytes) {
        Ok(s) => s,
        // Keep the valid prefix of a name cut mid-character.
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).ok()?,
    };
    let text = text.trim_end_matches('\0');
    if text.is_empty() {
        None
    } else {
        Some(device_name(text))
    }
}

/// Resolve a display name: complete local name, then shortened local name,
/// then the remote name property.
pub fn resolve_name(eir: &[u8], bd_name: Option<&str>) -> Option<DeviceName> {
    find_field(eir, AD_COMPLETE_NAME)
        .and_then(name_from_bytes)
        .or_else(|| find_field(eir, AD_SHORT_NAME).and_then(name_from_bytes))
        .or_else(|| bd_name.filter(|n| !n.is_empty()).map(device_name))
}

/// A class of device qualifies for pairing when it uses format type 1 and
/// its major class is phone or audio/video.
pub fn is_companion_class(cod: u32) -> bool {
    if cod & 0x03 != 0 {
        return false;
    }
    matches!((cod >> 8) & 0x1F, MAJOR_CLASS_PHONE | MAJOR_CLASS_AV)
}

/// GAP Appearance value from advertisement data.
pub fn appearance(data: &[u8]) -> Option<u16> {
    match find_field(data, AD_APPEARANCE)? {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Map a BLE appearance onto the class of device the pairing filter
/// understands.
pub fn class_from_appearance(appearance: u16) -> Option<u32> {
    match appearance >> 6 {
        // Phone
        0x01 => Some(COD_SMARTPHONE),
        // Media player, audio sink, audio source, wearable audio
        0x0A | 0x21 | 0x22 | 0x25 => Some(COD_HEADSET),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_name_wins_over_short_name() {
        let eir = [
            0x03, 0x08, b'P', b'h', // short "Ph"
            0x06, 0x09, b'P', b'h', b'o', b'n', b'e', // complete "Phone"
        ];
        assert_eq!(resolve_name(&eir, Some("raw")).unwrap().as_str(), "Phone");
    }

    #[test]
    fn short_name_used_without_complete_name() {
        let eir = [0x02, 0x01, 0x06, 0x05, 0x08, b'P', b'i', b'x', b'l'];
        assert_eq!(resolve_name(&eir, Some("raw")).unwrap().as_str(), "Pixl");
    }

    #[test]
    fn falls_back_to_remote_name_property() {
        let eir = [0x02, 0x01, 0x06];
        assert_eq!(resolve_name(&eir, Some("Galaxy")).unwrap().as_str(), "Galaxy");
        assert!(resolve_name(&eir, None).is_none());
        assert!(resolve_name(&[], Some("")).is_none());
    }

    #[test]
    fn malformed_lengths_stop_the_walk() {
        assert!(find_field(&[0x00], AD_COMPLETE_NAME).is_none());
        // Declared length runs past the end of the buffer.
        assert!(find_field(&[0x05, 0x09, b'a'], AD_COMPLETE_NAME).is_none());
    }

    #[test]
    fn invalid_utf8_keeps_valid_prefix() {
        let eir = [0x04, 0x09, b'A', b'b', 0xFF];
        assert_eq!(resolve_name(&eir, None).unwrap().as_str(), "Ab");
    }

    // ════════════════════════════════════════════════════════════════════════
    // Class of device
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn phone_and_av_classes_qualify() {
        assert!(is_companion_class(0x5A_02_0C)); // smartphone
        assert!(is_companion_class(0x24_04_04)); // headset
    }

    #[test]
    fn other_classes_are_filtered_out() {
        assert!(!is_companion_class(0x00_01_0C)); // computer
        assert!(!is_companion_class(0x00_05_40)); // peripheral/keyboard
        assert!(!is_companion_class(0x00_02_0D)); // bad format bits
    }

    #[test]
    fn appearance_maps_onto_class_of_device() {
        let adv = [0x03, 0x19, 0x40, 0x00]; // 0x0040 generic phone
        let class = class_from_appearance(appearance(&adv).unwrap()).unwrap();
        assert!(is_companion_class(class));
        assert!(class_from_appearance(0x03C1).is_none()); // keyboard
        assert!(class_from_appearance(0x0941).is_some()); // earbud
    }
}
