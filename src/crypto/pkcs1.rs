//! PKCS#1 v1.5 block formatting (RFC 8017 section 9.2 and 7.2).

use super::{CryptoError, DigestAlgorithm};

/// The minimum number of 0xff bytes in a type 1 block, or random bytes in
/// a type 2 block.
const MIN_PADDING: usize = 8;

/// DER encoded `DigestInfo` up to, and including, the digest OCTET STRING
/// header.
fn digest_info_prefix(alg: DigestAlgorithm) -> &'static [u8] {
    match alg {
        DigestAlgorithm::Sha1 => &[
            0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
        ],
        DigestAlgorithm::Sha256 => &[
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
            0x04, 0x20,
        ],
        DigestAlgorithm::Sha384 => &[
            0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00,
            0x04, 0x30,
        ],
        DigestAlgorithm::Sha512 => &[
            0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00,
            0x04, 0x40,
        ],
    }
}

/// Wraps a digest in a DER `DigestInfo`.
pub fn digest_info(alg: DigestAlgorithm, digest: &[u8]) -> Vec<u8> {
    let prefix = digest_info_prefix(alg);
    let mut out = Vec::with_capacity(prefix.len() + digest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(digest);
    out
}

/// Builds `00 01 ff .. ff 00 || data`, `k` bytes long.
pub fn pad_type1(data: &[u8], k: usize) -> Result<Vec<u8>, CryptoError> {
    if data.len() + MIN_PADDING + 3 > k {
        return Err(CryptoError::InvalidInput(format!(
            "{} bytes do not fit a {} byte PKCS#1 block",
            data.len(),
            k
        )));
    }
    let mut block = Vec::with_capacity(k);
    block.push(0x00);
    block.push(0x01);
    block.resize(k - data.len() - 1, 0xff);
    block.push(0x00);
    block.extend_from_slice(data);
    Ok(block)
}

/// Strips type 1 padding, returning the payload.
pub fn unpad_type1(block: &[u8]) -> Result<&[u8], CryptoError> {
    unpad(block, 0x01)
}

/// Strips type 2 (encryption) padding, returning the payload.
pub fn unpad_type2(block: &[u8]) -> Result<&[u8], CryptoError> {
    unpad(block, 0x02)
}

fn unpad(block: &[u8], block_type: u8) -> Result<&[u8], CryptoError> {
    let bad = || CryptoError::InvalidInput(format!("not a PKCS#1 type {} block", block_type));

    if block.len() < MIN_PADDING + 3 || block[0] != 0x00 || block[1] != block_type {
        return Err(bad());
    }
    let separator = block[2..].iter().position(|b| *b == 0x00).ok_or_else(bad)? + 2;
    let padding = &block[2..separator];
    if padding.len() < MIN_PADDING {
        return Err(bad());
    }
    if block_type == 0x01 && padding.iter().any(|b| *b != 0xff) {
        return Err(bad());
    }
    Ok(&block[separator + 1..])
}

/// Left pads `data` with zeros to `k` bytes.
pub fn left_pad(data: &[u8], k: usize) -> Result<Vec<u8>, CryptoError> {
    if data.len() > k {
        return Err(CryptoError::InvalidInput(format!(
            "{} bytes are longer than the {} byte modulus",
            data.len(),
            k
        )));
    }
    let mut out = vec![0u8; k - data.len()];
    out.extend_from_slice(data);
    Ok(out)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type1_padding() {
        let block = pad_type1(b"hello", 32).unwrap();
        assert_eq!(block.len(), 32);
        assert_eq!(&block[..2], &[0x00, 0x01]);
        assert_eq!(block[32 - 6], 0x00);
        assert_eq!(unpad_type1(&block).unwrap(), b"hello");
    }

    #[test]
    fn type1_padding_needs_room() {
        assert!(pad_type1(&[0u8; 22], 32).is_err());
        assert!(pad_type1(&[0u8; 21], 32).is_ok());
    }

    #[test]
    fn type2_block() {
        let mut block = vec![0x00, 0x02];
        block.extend_from_slice(&[0x5a; 10]);
        block.push(0x00);
        block.extend_from_slice(b"secret");
        assert_eq!(unpad_type2(&block).unwrap(), b"secret");
        assert!(unpad_type1(&block).is_err());
    }

    #[test]
    fn short_padding_rejected() {
        let block = [0x00, 0x01, 0xff, 0xff, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert!(unpad_type1(&block).is_err());
    }

    #[test]
    fn digest_info_lengths() {
        for (alg, len) in [
            (DigestAlgorithm::Sha1, 35),
            (DigestAlgorithm::Sha256, 51),
            (DigestAlgorithm::Sha384, 67),
            (DigestAlgorithm::Sha512, 83),
        ] {
            let info = digest_info(alg, &vec![0u8; alg.output_len()]);
            assert_eq!(info.len(), len);
            assert_eq!(info[1] as usize, len - 2);
        }
    }
}
