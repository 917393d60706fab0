//! Detection and transcoding of GBK output
//!
//! Tools running under a Chinese Windows locale emit GBK rather than UTF-8.
//! Everything leaving a session is normalized to UTF-8 here.

use std::borrow::Cow;

use encoding_rs::GBK;

use crate::error::{Result, SessionError};

/// Check whether `data` looks like GBK rather than UTF-8
///
/// Valid UTF-8 always wins. Otherwise every byte above the ASCII range must
/// start a lead/trail pair: lead in `0x81..=0xFE`, trail in `0x40..=0xFE`
/// excluding `0xF7`. A lead byte with no trail byte left is not GBK.
pub fn is_legacy_encoding(data: &[u8]) -> bool {
    if std::str::from_utf8(data).is_ok() {
        return false;
    }

    let mut i = 0;
    while i < data.len() {
        let lead = data[i];
        if lead <= 0x7f {
            i += 1;
            continue;
        }

        match (lead, data.get(i + 1)) {
            (0x81..=0xfe, Some(&trail)) if (0x40..=0xfe).contains(&trail) && trail != 0xf7 => {
                i += 2;
            }
            _ => return false,
        }
    }
    true
}

/// Convert GBK bytes to UTF-8
pub fn transcode(data: &[u8]) -> Result<Vec<u8>> {
    GBK.decode_without_bom_handling_and_without_replacement(data)
        .map(|text| text.into_owned().into_bytes())
        .ok_or_else(|| SessionError::Decode("byte sequence has no GBK mapping".to_string()))
}

/// Return `data` as UTF-8, transcoding when it is detected as GBK
///
/// Bytes that are neither UTF-8 nor GBK are passed through unchanged; the
/// caller decides how lossy to be when turning them into text.
pub fn normalize(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if is_legacy_encoding(data) {
        Ok(Cow::Owned(transcode(data)?))
    } else {
        Ok(Cow::Borrowed(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // "中文" in GBK
    const GBK_ZHONGWEN: &[u8] = &[0xd6, 0xd0, 0xce, 0xc4];

    #[test]
    fn test_utf8_is_never_legacy() {
        assert!(!is_legacy_encoding(b""));
        assert!(!is_legacy_encoding(b"FileName: a.jpg"));
        assert!(!is_legacy_encoding("标题: 中文".as_bytes()));
    }

    #[test]
    fn test_gbk_pairs_detected() {
        assert!(is_legacy_encoding(GBK_ZHONGWEN));

        let mut mixed = b"Title: ".to_vec();
        mixed.extend_from_slice(GBK_ZHONGWEN);
        mixed.extend_from_slice(b"\n");
        assert!(is_legacy_encoding(&mixed));
    }

    #[test]
    fn test_dangling_lead_byte_is_not_legacy() {
        let mut data = GBK_ZHONGWEN.to_vec();
        data.push(0xd6);
        assert!(!is_legacy_encoding(&data));
    }

    #[test]
    fn test_invalid_pairs_rejected() {
        // 0x80 and 0xff are never lead bytes
        assert!(!is_legacy_encoding(&[0x80, 0x41]));
        assert!(!is_legacy_encoding(&[0xff, 0x41]));
        // trail byte below range, and the excluded 0xf7
        assert!(!is_legacy_encoding(&[0xd6, 0x30]));
        assert!(!is_legacy_encoding(&[0xd6, 0xf7]));
    }

    #[test]
    fn test_transcode_gbk() {
        let out = transcode(GBK_ZHONGWEN).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "中文");
    }

    #[test]
    fn test_every_valid_pair_transcodes_to_utf8() {
        for lead in (0x81u8..=0xfe).step_by(7) {
            for trail in (0x40u8..=0xfe).filter(|b| *b != 0x7f && *b != 0xf7).step_by(5) {
                let data = [b'a', lead, trail, b'\n'];
                if std::str::from_utf8(&data).is_ok() {
                    continue;
                }
                assert!(is_legacy_encoding(&data), "{:02x} {:02x}", lead, trail);
                let out = transcode(&data).unwrap();
                assert!(String::from_utf8(out).is_ok(), "{:02x} {:02x}", lead, trail);
            }
        }
    }

    #[test]
    fn test_detected_pair_without_mapping_fails_to_decode() {
        // 0x7f passes the trail range check but GBK has no such pair
        let data = [0x81, 0x7f];
        assert!(is_legacy_encoding(&data));
        assert!(matches!(transcode(&data), Err(SessionError::Decode(_))));
        assert!(matches!(normalize(&data), Err(SessionError::Decode(_))));
    }

    #[test]
    fn test_normalize_borrows_utf8() {
        let data = b"plain ascii";
        assert!(matches!(normalize(data).unwrap(), Cow::Borrowed(_)));

        let normalized = normalize(GBK_ZHONGWEN).unwrap();
        assert_eq!(&*normalized, "中文".as_bytes());
    }
}
