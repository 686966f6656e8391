use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use nalgebra::Vector3;
use ndarray::Array1;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;
use ply_rs::{parser, ply};

use super::LoadError;
use crate::pointcloud::PointCloud;

/// We only care about coordinates and optional normals; every other vertex
/// property is ignored.
#[derive(Debug)]
struct Vertex {
    point: [f32; 3],
    normal: [f32; 3],
}

impl ply::PropertyAccess for Vertex {
    fn new() -> Self {
        Vertex {
            point: [0f32; 3],
            normal: [0f32; 3],
        }
    }
    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("x", ply::Property::Float(v)) => self.point[0] = v,
            ("y", ply::Property::Float(v)) => self.point[1] = v,
            ("z", ply::Property::Float(v)) => self.point[2] = v,
            ("x", ply::Property::Double(v)) => self.point[0] = v as f32,
            ("y", ply::Property::Double(v)) => self.point[1] = v as f32,
            ("z", ply::Property::Double(v)) => self.point[2] = v as f32,
            ("nx", ply::Property::Float(v)) => self.normal[0] = v,
            ("ny", ply::Property::Float(v)) => self.normal[1] = v,
            ("nz", ply::Property::Float(v)) => self.normal[2] = v,
            (_, _) => (),
        }
    }
}

/// Reads the vertex element of a PLY file into a point cloud. Normals come
/// along when the file carries nx/ny/nz; faces and colors are skipped.
pub fn read_ply<P>(filepath: P) -> Result<PointCloud, LoadError>
where
    P: AsRef<Path>,
{
    let fptr = File::open(filepath)?;
    let mut f = std::io::BufReader::new(fptr);

    let vertex_parser = parser::Parser::<Vertex>::new();
    let header = vertex_parser
        .read_header(&mut f)
        .map_err(|err| LoadError::Parser(format!("PLY header: {err}")))?;

    let mut points = None;
    let mut normals = None;
    for (_ignore_key, element) in &header.elements {
        match element.name.as_ref() {
            "vertex" => {
                let vertex_vec = vertex_parser
                    .read_payload_for_element(&mut f, element, &header)
                    .map_err(|err| LoadError::Parser(format!("PLY payload: {err}")))?;

                points = Some(Array1::from_iter(
                    vertex_vec
                        .iter()
                        .map(|v| Vector3::new(v.point[0], v.point[1], v.point[2])),
                ));

                if ["nx", "ny", "nz"]
                    .iter()
                    .all(|k| element.properties.contains_key(*k))
                {
                    normals = Some(Array1::from_iter(vertex_vec.iter().map(|v| {
                        Vector3::new(v.normal[0], v.normal[1], v.normal[2])
                    })));
                }
            }
            // Faces and any other elements are irrelevant for mapping.
            _ => continue,
        }
    }

    let points = points.ok_or_else(|| LoadError::Parser("PLY without vertex element".into()))?;
    Ok(PointCloud {
        points,
        normals,
    })
}

/// Writes a points-only ASCII PLY file.
pub fn write_ply<P>(filepath: P, cloud: &PointCloud) -> Result<(), std::io::Error>
where
    P: AsRef<Path>,
{
    let mut ply = {
        let mut ply = Ply::<DefaultElement>::new();
        let mut vertex_element = ElementDef::new("vertex".to_string());
        ["x", "y", "z"].iter().for_each(|key| {
            vertex_element.properties.add(PropertyDef::new(
                key.to_string(),
                PropertyType::Scalar(ScalarType::Float),
            ));
        });

        let vertex_array: Vec<DefaultElement> = cloud
            .points
            .iter()
            .map(|point| {
                let mut elem = DefaultElement::new();
                elem.insert("x".to_string(), Property::Float(point[0]));
                elem.insert("y".to_string(), Property::Float(point[1]));
                elem.insert("z".to_string(), Property::Float(point[2]));
                elem
            })
            .collect();

        ply.header.elements.add(vertex_element);
        ply.payload.insert("vertex".to_string(), vertex_array);

        ply.make_consistent()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
        ply
    };

    ply.header.encoding = Encoding::Ascii;

    let mut buf = BufWriter::new(File::create(filepath)?);
    Writer::new().write_ply(&mut buf, &mut ply)?;

    Ok(())
}
