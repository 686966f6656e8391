use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use itertools::izip;
use nalgebra::Vector3;
use ndarray::Array1;

use super::LoadError;

/// Byte layout of one header field.
struct FieldLayout {
    name: String,
    size: usize,
    kind: char,
    count: usize,
}

struct Header {
    fields: Vec<FieldLayout>,
    points: usize,
    data: String,
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<Header, LoadError> {
    let mut names: Vec<String> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();
    let mut kinds: Vec<char> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let mut points = None;
    let mut data = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(LoadError::Parser("unexpected end of PCD header".into()));
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let rest: Vec<&str> = tokens.collect();
        match keyword {
            "FIELDS" => names = rest.iter().map(|s| s.to_string()).collect(),
            "SIZE" => {
                sizes = rest
                    .iter()
                    .map(|s| s.parse().map_err(|_| bad_header("SIZE")))
                    .collect::<Result<_, _>>()?
            }
            "TYPE" => kinds = rest.iter().filter_map(|s| s.chars().next()).collect(),
            "COUNT" => {
                counts = rest
                    .iter()
                    .map(|s| s.parse().map_err(|_| bad_header("COUNT")))
                    .collect::<Result<_, _>>()?
            }
            "POINTS" => {
                points = Some(
                    rest.first()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| bad_header("POINTS"))?,
                )
            }
            "DATA" => {
                data = Some(rest.first().unwrap_or(&"").to_string());
                break;
            }
            // VERSION, WIDTH, HEIGHT, VIEWPOINT are not needed to decode.
            _ => {}
        }
    }

    if names.is_empty() {
        return Err(LoadError::Parser("PCD header without FIELDS".into()));
    }
    if sizes.len() != names.len() || kinds.len() != names.len() {
        return Err(LoadError::Parser("inconsistent PCD field layout".into()));
    }
    if counts.is_empty() {
        counts = vec![1; names.len()];
    }

    let fields = izip!(names, sizes, kinds, counts)
        .map(|(name, size, kind, count)| FieldLayout {
            name,
            size,
            kind,
            count,
        })
        .collect();

    Ok(Header {
        fields,
        points: points.ok_or_else(|| bad_header("POINTS"))?,
        data: data.unwrap_or_default(),
    })
}

fn bad_header(keyword: &str) -> LoadError {
    LoadError::Parser(format!("malformed PCD header entry {keyword}"))
}

/// Reads the x/y/z columns of a PCD file with `ascii` or `binary` data.
/// Any other fields are skipped over.
pub fn read_pcd(path: impl AsRef<Path>) -> Result<Array1<Vector3<f32>>, LoadError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let header = parse_header(&mut reader)?;

    let component = |name: &str| -> Result<usize, LoadError> {
        header
            .fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| LoadError::Parser(format!("PCD file lacks field {name}")))
    };
    let xyz = [component("x")?, component("y")?, component("z")?];

    match header.data.as_str() {
        "ascii" => read_ascii(&mut reader, &header, &xyz),
        "binary" => read_binary(&mut reader, &header, &xyz),
        other => Err(LoadError::Parser(format!(
            "unsupported PCD data encoding '{other}'"
        ))),
    }
}

fn read_ascii<R: BufRead>(
    reader: &mut R,
    header: &Header,
    xyz: &[usize; 3],
) -> Result<Array1<Vector3<f32>>, LoadError> {
    let mut points = Vec::with_capacity(header.points);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut values = [0.0f32; 3];
        for (slot, field_index) in xyz.iter().enumerate() {
            // Token offset of the field: preceding fields contribute their
            // counts.
            let offset: usize = header.fields[..*field_index]
                .iter()
                .map(|field| field.count)
                .sum();
            let token = tokens
                .get(offset)
                .ok_or_else(|| LoadError::Parser("short PCD data row".into()))?;
            values[slot] = token
                .parse()
                .map_err(|_| LoadError::Parser(format!("bad PCD value '{token}'")))?;
        }
        points.push(Vector3::new(values[0], values[1], values[2]));
        if points.len() == header.points {
            break;
        }
    }
    Ok(Array1::from_vec(points))
}

fn read_binary<R: Read>(
    reader: &mut R,
    header: &Header,
    xyz: &[usize; 3],
) -> Result<Array1<Vector3<f32>>, LoadError> {
    let stride: usize = header
        .fields
        .iter()
        .map(|field| field.size * field.count)
        .sum();
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    if payload.len() < stride * header.points {
        return Err(LoadError::Parser("truncated binary PCD payload".into()));
    }

    let offsets: Vec<usize> = xyz
        .iter()
        .map(|field_index| {
            header.fields[..*field_index]
                .iter()
                .map(|field| field.size * field.count)
                .sum()
        })
        .collect();

    let mut points = Vec::with_capacity(header.points);
    for record in 0..header.points {
        let base = record * stride;
        let mut values = [0.0f32; 3];
        for (slot, field_index) in xyz.iter().enumerate() {
            let field = &header.fields[*field_index];
            let start = base + offsets[slot];
            values[slot] = match (field.kind, field.size) {
                ('F', 4) => f32::from_le_bytes(
                    payload[start..start + 4].try_into().expect("bounds checked"),
                ),
                ('F', 8) => f64::from_le_bytes(
                    payload[start..start + 8].try_into().expect("bounds checked"),
                ) as f32,
                (kind, size) => {
                    return Err(LoadError::Parser(format!(
                        "unsupported coordinate type {kind}{size} in PCD"
                    )))
                }
            };
        }
        points.push(Vector3::new(values[0], values[1], values[2]));
    }
    Ok(Array1::from_vec(points))
}

/// Writes an ASCII PCD file holding only x y z columns.
pub fn write_pcd(
    path: impl AsRef<Path>,
    points: &Array1<Vector3<f32>>,
) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(writer, "VERSION 0.7")?;
    writeln!(writer, "FIELDS x y z")?;
    writeln!(writer, "SIZE 4 4 4")?;
    writeln!(writer, "TYPE F F F")?;
    writeln!(writer, "COUNT 1 1 1")?;
    writeln!(writer, "WIDTH {}", points.len())?;
    writeln!(writer, "HEIGHT 1")?;
    writeln!(writer, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(writer, "POINTS {}", points.len())?;
    writeln!(writer, "DATA ascii")?;
    for point in points.iter() {
        writeln!(writer, "{} {} {}", point[0], point[1], point[2])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ascii_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        let points = array![
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(-0.5, 0.25, 10.125),
        ];
        write_pcd(&path, &points).unwrap();

        let loaded = read_pcd(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        for (a, b) in loaded.iter().zip(points.iter()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn ascii_with_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        std::fs::write(
            &path,
            "VERSION .7\nFIELDS x y z intensity\nSIZE 4 4 4 4\nTYPE F F F F\nCOUNT 1 1 1 1\n\
             WIDTH 2\nHEIGHT 1\nVIEWPOINT 0 0 0 1 0 0 0\nPOINTS 2\nDATA ascii\n\
             1 2 3 0.5\n4 5 6 0.25\n",
        )
        .unwrap();

        let loaded = read_pcd(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], Vector3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn binary_payload_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        let mut content = b"VERSION .7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\n\
             WIDTH 2\nHEIGHT 1\nPOINTS 2\nDATA binary\n"
            .to_vec();
        for value in [1.0f32, 2.0, 3.0, -1.0, -2.0, -3.0] {
            content.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(&path, content).unwrap();

        let loaded = read_pcd(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(loaded[1], Vector3::new(-1.0, -2.0, -3.0));
    }

    #[test]
    fn missing_coordinate_field_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        std::fs::write(
            &path,
            "FIELDS x y\nSIZE 4 4\nTYPE F F\nCOUNT 1 1\nPOINTS 1\nDATA ascii\n1 2\n",
        )
        .unwrap();
        assert!(matches!(read_pcd(&path), Err(LoadError::Parser(_))));
    }

    #[test]
    fn compressed_encoding_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        std::fs::write(
            &path,
            "FIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\nPOINTS 0\nDATA binary_compressed\n",
        )
        .unwrap();
        assert!(read_pcd(&path).is_err());
    }
}
