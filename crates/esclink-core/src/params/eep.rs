//! Binary (EEP) parameter file codec
//!
//! The compact form pushed around by provisioning scripts: the four blocks
//! concatenated in wire order (board, id, uart, tune) followed by a CRC-32
//! trailer over the blocks, little-endian.

use byteorder::{ByteOrder, LittleEndian};

use super::{ParamError, ParamKind, ParameterSet};

/// Total length of an EEP image: all four blocks plus the CRC-32 trailer.
pub const EEP_LEN: usize = 16 + 8 + 8 + 24 + 4;

/// Errors that can occur while reading or writing EEP parameter images.
#[derive(Debug, thiserror::Error)]
pub enum EepError {
    /// The image is not exactly [`EEP_LEN`] bytes.
    #[error("EEP image is {actual} bytes, expected {expected}")]
    WrongLength {
        /// Required length.
        expected: usize,
        /// Length actually seen.
        actual: usize,
    },

    /// The CRC-32 trailer does not match the block bytes.
    #[error("EEP checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC computed over the blocks.
        expected: u32,
        /// CRC stored in the trailer.
        actual: u32,
    },

    /// Block-level error while assembling the image.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Encode a complete [`ParameterSet`] as an EEP image.
pub fn params_to_eep(set: &ParameterSet) -> Result<Vec<u8>, EepError> {
    let mut out = Vec::with_capacity(EEP_LEN);
    for kind in ParamKind::ALL {
        let block = set.block(kind).ok_or(ParamError::MissingBlock(kind))?;
        if block.len() != kind.block_len() {
            return Err(ParamError::WrongLength {
                kind,
                expected: kind.block_len(),
                actual: block.len(),
            }
            .into());
        }
        out.extend_from_slice(block);
    }
    let crc = crc32fast::hash(&out);
    let mut trailer = [0u8; 4];
    LittleEndian::write_u32(&mut trailer, crc);
    out.extend_from_slice(&trailer);
    Ok(out)
}

/// Decode an EEP image into a [`ParameterSet`].
pub fn params_from_eep(bytes: &[u8]) -> Result<ParameterSet, EepError> {
    if bytes.len() != EEP_LEN {
        return Err(EepError::WrongLength {
            expected: EEP_LEN,
            actual: bytes.len(),
        });
    }
    let (blocks, trailer) = bytes.split_at(EEP_LEN - 4);
    let expected = crc32fast::hash(blocks);
    let actual = LittleEndian::read_u32(trailer);
    if expected != actual {
        return Err(EepError::ChecksumMismatch { expected, actual });
    }

    let mut set = ParameterSet::default();
    let mut offset = 0;
    for kind in ParamKind::ALL {
        let len = kind.block_len();
        set.set_block(kind, blocks[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::sample_set;
    use pretty_assertions::assert_eq;

    #[test]
    fn eep_roundtrip_preserves_blocks() {
        let set = sample_set();
        let image = params_to_eep(&set).unwrap();
        assert_eq!(image.len(), EEP_LEN);
        let back = params_from_eep(&image).unwrap();
        assert!(back.matches(&set));
        assert!(back.is_valid());
    }

    #[test]
    fn corrupted_image_is_rejected() {
        let mut image = params_to_eep(&sample_set()).unwrap();
        image[10] ^= 0xFF;
        assert!(matches!(
            params_from_eep(&image),
            Err(EepError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = params_to_eep(&sample_set()).unwrap();
        assert!(matches!(
            params_from_eep(&image[..image.len() - 1]),
            Err(EepError::WrongLength { .. })
        ));
    }

    #[test]
    fn xml_and_eep_agree() {
        // structured-text encode -> decode -> binary encode -> decode must
        // land on identical byte blocks
        let set = sample_set();
        let xml = crate::params::params_to_xml(&set).unwrap();
        let from_xml = crate::params::params_from_xml(&xml).unwrap();
        let eep = params_to_eep(&from_xml).unwrap();
        let from_eep = params_from_eep(&eep).unwrap();
        assert!(from_eep.matches(&set));
        for kind in ParamKind::ALL {
            assert_eq!(from_eep.block(kind), set.block(kind));
        }
    }
}
