mod bin;
mod error;
mod pcd;
mod ply;
mod poses;

pub use error::LoadError;
pub use pcd::{read_pcd, write_pcd};
pub use ply::{read_ply, write_ply};
pub use poses::{write_pose_tensor_npy, write_trajectory, write_waypoints};

use std::path::{Path, PathBuf};

use glob::glob;
use nalgebra::Vector3;
use ndarray::Array1;

use crate::pointcloud::PointCloud;

/// Supported on-disk point cloud encodings, dispatched by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFormat {
    Pcd,
    Ply,
    Bin,
}

impl CloudFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pcd" => Some(CloudFormat::Pcd),
            "ply" => Some(CloudFormat::Ply),
            "bin" => Some(CloudFormat::Bin),
            _ => None,
        }
    }
}

/// Loads the (x, y, z) triples of any supported cloud file. Extra per-point
/// fields (intensity, color, normals) are ignored.
pub fn load_points(path: &Path) -> Result<Array1<Vector3<f32>>, LoadError> {
    let format = CloudFormat::from_path(path).ok_or_else(|| {
        LoadError::UnknownFormat(path.to_string_lossy().into_owned())
    })?;
    match format {
        CloudFormat::Pcd => read_pcd(path),
        CloudFormat::Ply => Ok(ply::read_ply(path)?.points),
        CloudFormat::Bin => bin::read_bin(path),
    }
}

/// Enumerates the cloud files of a sequence directory in ascending
/// lexicographic filename order.
pub fn discover_frames(directory: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut frames = Vec::new();
    for extension in ["pcd", "ply", "bin"] {
        let pattern = directory.join(format!("*.{extension}"));
        let matches = glob(&pattern.to_string_lossy())
            .map_err(|err| LoadError::Parser(err.to_string()))?;
        for entry in matches {
            frames.push(entry.map_err(|err| LoadError::Parser(err.to_string()))?);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Writes the finalized map in both output formats next to each other.
pub fn write_map(directory: &Path, map: &PointCloud) -> Result<(), std::io::Error> {
    write_ply(&directory.join("map.ply"), map)?;
    write_pcd(&directory.join("map.pcd"), &map.points)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn format_dispatch_by_extension() {
        assert_eq!(
            CloudFormat::from_path(Path::new("scans/000001.pcd")),
            Some(CloudFormat::Pcd)
        );
        assert_eq!(
            CloudFormat::from_path(Path::new("a.PLY")),
            Some(CloudFormat::Ply)
        );
        assert_eq!(
            CloudFormat::from_path(Path::new("velodyne/0.bin")),
            Some(CloudFormat::Bin)
        );
        assert_eq!(CloudFormat::from_path(Path::new("notes.txt")), None);
        assert_eq!(CloudFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn discovery_is_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["000010.pcd", "000002.pcd", "000001.pcd"] {
            fs::write(
                dir.path().join(name),
                "VERSION .7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\nWIDTH 1\nHEIGHT 1\nPOINTS 1\nDATA ascii\n0 0 0\n",
            )
            .unwrap();
        }
        fs::write(dir.path().join("README.md"), "not a cloud").unwrap();

        let frames = discover_frames(dir.path()).unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["000001.pcd", "000002.pcd", "000010.pcd"]);
    }
}
