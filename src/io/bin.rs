use std::fs;
use std::path::Path;

use nalgebra::Vector3;
use ndarray::Array1;

use super::LoadError;

/// Reads a packed little-endian f32 point file (KITTI velodyne style).
///
/// The record stride is inferred from the file length: four floats per
/// point (x y z intensity) is preferred, three accepted. Anything else is a
/// parse error.
pub fn read_bin(path: impl AsRef<Path>) -> Result<Array1<Vector3<f32>>, LoadError> {
    let payload = fs::read(path)?;
    if payload.is_empty() {
        return Ok(Array1::from_vec(Vec::new()));
    }

    let floats_per_point = if payload.len() % 16 == 0 {
        4
    } else if payload.len() % 12 == 0 {
        3
    } else {
        return Err(LoadError::Parser(format!(
            "bin payload of {} bytes is not a multiple of 3 or 4 floats",
            payload.len()
        )));
    };

    let stride = 4 * floats_per_point;
    let points = (0..payload.len() / stride)
        .map(|record| {
            let base = record * stride;
            let read = |offset: usize| {
                f32::from_le_bytes(
                    payload[base + offset..base + offset + 4]
                        .try_into()
                        .expect("bounds checked"),
                )
            };
            Vector3::new(read(0), read(4), read(8))
        })
        .collect();
    Ok(Array1::from_vec(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn four_float_records_drop_intensity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.bin");
        std::fs::write(&path, pack(&[1.0, 2.0, 3.0, 0.9, 4.0, 5.0, 6.0, 0.1])).unwrap();

        let points = read_bin(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(points[1], Vector3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn three_float_records_parse_when_length_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.bin");
        // 3 points x 3 floats = 36 bytes, not divisible by 16.
        std::fs::write(
            &path,
            pack(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]),
        )
        .unwrap();

        let points = read_bin(&path).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[2], Vector3::new(7.0, 8.0, 9.0));
    }

    #[test]
    fn ragged_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(read_bin(&path).is_err());
    }

    #[test]
    fn empty_file_is_an_empty_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.bin");
        std::fs::write(&path, []).unwrap();
        assert!(read_bin(&path).unwrap().is_empty());
    }
}
