//! Feature vectors as little-endian `f32` blobs.

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.is_empty() {
        return Err("empty vector blob".into());
    }
    if blob.len() % 4 != 0 {
        return Err(format!("blob length {} is not a multiple of 4", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian() {
        assert_eq!(encode_vector(&[1.0]), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(decode_vector(&[0, 0, 0]).is_err());
        assert!(decode_vector(&[]).is_err());
    }

    #[test]
    fn test_decode_preserves_values() {
        let values = [0.25f32, -3.5, 1e-7];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
    }
}
