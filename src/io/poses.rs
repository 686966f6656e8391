use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::Vector2;
use ndarray::Array3;
use ndarray_npy::write_npy;

use crate::trajectory::Trajectory;
use crate::transform::Transform;

/// Writes the optimized trajectory as `id x y z qx qy qz qw` per line.
///
/// The quaternion comes from the pose's rotation via the standard
/// trace-based matrix conversion and is unit-normalized by construction.
pub fn write_trajectory(
    path: impl AsRef<Path>,
    trajectory: &Trajectory,
) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# Trajectory from mapping")?;
    writeln!(writer, "# Format: id x y z qx qy qz qw")?;
    writeln!(writer)?;

    for (index, pose) in trajectory.iter().enumerate() {
        let t = pose.translation();
        let q = pose.rotation();
        writeln!(
            writer,
            "{index} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
            t[0], t[1], t[2], q.i, q.j, q.k, q.w
        )?;
    }
    Ok(())
}

/// Writes waypoints in the path-following format: header comments, then
/// one `x y` pair per line with four decimals.
pub fn write_waypoints(
    path: impl AsRef<Path>,
    waypoints: &[Vector2<f32>],
) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# Waypoints extracted from mapping trajectory")?;
    writeln!(writer, "# Format: x y (meters)")?;
    writeln!(writer, "# Total waypoints: {}", waypoints.len())?;
    writeln!(writer)?;

    for waypoint in waypoints {
        writeln!(writer, "{:.4} {:.4}", waypoint.x, waypoint.y)?;
    }
    Ok(())
}

/// Dumps the raw odometry chain as an [N, 4, 4] float64 npy tensor.
pub fn write_pose_tensor_npy(
    path: impl AsRef<Path>,
    poses: &[Transform],
) -> Result<(), std::io::Error> {
    let mut tensor = Array3::<f64>::zeros((poses.len(), 4, 4));
    for (index, pose) in poses.iter().enumerate() {
        let matrix = nalgebra::Matrix4::<f32>::from(pose);
        for row in 0..4 {
            for column in 0..4 {
                tensor[(index, row, column)] = matrix[(row, column)] as f64;
            }
        }
    }
    write_npy(path, &tensor)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}
